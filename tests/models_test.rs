//! Tests for data models
//!
//! These tests pin the JSON shapes and status strings other tools read.

use appconsole_backend::models::{
    Application, ApplicationStatus, ApplicationView, DeploymentView, ObjectKey, Template,
};
use serde_json::json;

#[test]
fn test_application_serialization() {
    let mut app = Application::new("admin", "blog", "wordpress");
    app.namespace = Some("appconsole-admin-blog".to_string());

    let value = serde_json::to_value(&app).unwrap();
    assert_eq!(value["owner"], "admin");
    assert_eq!(value["displayName"], "blog");
    assert_eq!(value["template"], "wordpress");
    assert_eq!(value["namespace"], "appconsole-admin-blog");
    assert_eq!(value["status"], "Not Deployed");
    assert!(value["createdTime"].is_string());
}

#[test]
fn test_application_status_strings() {
    for (status, text) in [
        (ApplicationStatus::NotDeployed, "Not Deployed"),
        (ApplicationStatus::Pending, "Pending"),
        (ApplicationStatus::Running, "Running"),
        (ApplicationStatus::Failed, "Failed"),
        (ApplicationStatus::Terminating, "Terminating"),
    ] {
        assert_eq!(status.to_string(), text);
        assert_eq!(text.parse::<ApplicationStatus>().unwrap(), status);
        assert_eq!(serde_json::to_value(status).unwrap(), json!(text));
    }

    assert!("Deploying".parse::<ApplicationStatus>().is_err());
}

#[test]
fn test_application_view_flattens_record() {
    let view = ApplicationView {
        application: Application::new("admin", "blog", "wordpress"),
        services: vec![],
        deployments: vec![DeploymentView {
            name: "web".to_string(),
            desired: 2,
            ready: 1,
            available: 1,
            updated: 2,
            observed: true,
            failure: None,
        }],
        urls: vec!["http://10.0.0.2:30080".to_string()],
    };

    let value = serde_json::to_value(&view).unwrap();
    assert_eq!(value["name"], "blog");
    assert_eq!(value["deployments"][0]["desired"], 2);
    assert_eq!(value["deployments"][0]["observed"], true);
    assert_eq!(value["urls"][0], "http://10.0.0.2:30080");
}

#[test]
fn test_template_defaults() {
    let template = Template::new("admin", "wordpress", "kind: Service\n");
    assert_eq!(template.version, "1.0.0");
    assert_eq!(template.key(), ObjectKey::new("admin", "wordpress"));
}

#[test]
fn test_application_keys() {
    let app = Application::new("admin", "blog", "wordpress");
    assert_eq!(app.id(), "admin/blog");
    assert_eq!(app.template_key().to_string(), "admin/wordpress");
}
