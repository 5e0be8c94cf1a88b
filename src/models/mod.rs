pub mod application;
pub mod template;

pub use application::*;
pub use template::*;

use std::fmt;
use std::str::FromStr;

/// Owner/Name composite key, written `owner/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub owner: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(owner: &str, name: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(ObjectKey::new(owner, name))
            }
            _ => Err(format!("invalid id '{}', expected owner/name", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_key() {
        let key: ObjectKey = "admin/wordpress".parse().unwrap();
        assert_eq!(key.owner, "admin");
        assert_eq!(key.name, "wordpress");
        assert_eq!(key.to_string(), "admin/wordpress");
    }

    #[test]
    fn test_parse_object_key_rejects_malformed() {
        assert!("admin".parse::<ObjectKey>().is_err());
        assert!("/wordpress".parse::<ObjectKey>().is_err());
        assert!("admin/".parse::<ObjectKey>().is_err());
        assert!("admin/a/b".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ApplicationStatus::NotDeployed.to_string(), "Not Deployed");
        assert_eq!(
            "Terminating".parse::<ApplicationStatus>().unwrap(),
            ApplicationStatus::Terminating
        );
        assert!("Deploying".parse::<ApplicationStatus>().is_err());
        assert_eq!(
            serde_json::to_value(ApplicationStatus::NotDeployed).unwrap(),
            "Not Deployed"
        );
    }

    #[test]
    fn test_transitional_statuses() {
        assert!(ApplicationStatus::Pending.is_transitional());
        assert!(ApplicationStatus::Terminating.is_transitional());
        assert!(!ApplicationStatus::Running.is_transitional());
        assert!(!ApplicationStatus::Failed.is_transitional());
        assert!(!ApplicationStatus::NotDeployed.is_transitional());
    }
}
