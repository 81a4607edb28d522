use std::fmt;
use std::num::NonZeroU32;

/// Which GPU a reading belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitSlot {
    /// A single GPU, by `nvidia-smi` index.
    Unit(u32),
    /// The mean across every GPU on the host.
    Aggregate,
}

impl UnitSlot {
    /// The `--id=<n>` selector for this slot, `None` for the aggregate.
    pub fn selector(&self) -> Option<u32> {
        match self {
            UnitSlot::Unit(index) => Some(*index),
            UnitSlot::Aggregate => None,
        }
    }

    /// Value of the `gpu_id` label.
    pub fn label(&self) -> String {
        match self {
            UnitSlot::Unit(index) => format!("gpu_{}", index),
            UnitSlot::Aggregate => "avg".to_string(),
        }
    }

    /// Every per-unit slot for `unit_count` GPUs followed by the aggregate.
    pub fn all(unit_count: NonZeroU32) -> impl Iterator<Item = UnitSlot> {
        (0..unit_count.get())
            .map(UnitSlot::Unit)
            .chain(std::iter::once(UnitSlot::Aggregate))
    }
}

impl fmt::Display for UnitSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitSlot::Unit(index) => write!(f, "{}", index),
            UnitSlot::Aggregate => f.write_str("avg"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(UnitSlot::Unit(0).label(), "gpu_0");
        assert_eq!(UnitSlot::Unit(7).label(), "gpu_7");
        assert_eq!(UnitSlot::Aggregate.label(), "avg");
    }

    #[test]
    fn test_selector() {
        assert_eq!(UnitSlot::Unit(3).selector(), Some(3));
        assert_eq!(UnitSlot::Aggregate.selector(), None);
    }

    #[test]
    fn test_all_slots() {
        let slots: Vec<_> = UnitSlot::all(NonZeroU32::new(2).unwrap()).collect();
        assert_eq!(
            slots,
            vec![UnitSlot::Unit(0), UnitSlot::Unit(1), UnitSlot::Aggregate]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(UnitSlot::Unit(1).to_string(), "1");
        assert_eq!(UnitSlot::Aggregate.to_string(), "avg");
    }
}
