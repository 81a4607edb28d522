use std::collections::BTreeMap;
use std::fmt;

use crate::error::{MetadataError, MetadataResult};

/// Where this collector runs. Resolved once at startup and attached to
/// every published point as `gce_instance` resource labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub project_id: String,
    pub zone: String,
    pub instance_id: String,
}

impl InstanceIdentity {
    pub fn new(
        project_id: impl Into<String>,
        zone: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            zone: zone.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Labels of the `gce_instance` monitored resource.
    pub fn resource_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("instance_id".to_string(), self.instance_id.clone()),
            ("zone".to_string(), self.zone.clone()),
            ("project_id".to_string(), self.project_id.clone()),
        ])
    }
}

impl fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project_id, self.zone, self.instance_id)
    }
}

/// Split the `instance/zone` value into `(project, zone)`.
///
/// The value looks like `projects/123456789/zones/us-central1-a`: the
/// project is the second segment and the zone the last.
pub fn parse_zone_path(value: &str) -> MetadataResult<(String, String)> {
    let value = value.trim();
    let segments: Vec<&str> = value.split('/').collect();
    if segments.len() < 4 {
        return Err(MetadataError::MalformedZone(value.to_string()));
    }

    let project = segments[1];
    let zone = segments[segments.len() - 1];
    if project.is_empty() || zone.is_empty() {
        return Err(MetadataError::MalformedZone(value.to_string()));
    }
    Ok((project.to_string(), zone.to_string()))
}
