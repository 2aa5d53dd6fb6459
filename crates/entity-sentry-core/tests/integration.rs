use entity_sentry_core::{
    ClassificationRequest, ConfigLoader, DisabledTextGeneration, EntityClassifier,
};
use std::sync::Arc;

#[tokio::test]
async fn test_classifier_public_api_round_trip() {
    let loader = ConfigLoader::new();
    let classifier = EntityClassifier::new(
        &["US".to_string()],
        &loader,
        Arc::new(DisabledTextGeneration),
    )
    .expect("builtin US config must construct a classifier");

    let request = ClassificationRequest {
        text: "Contact SSN 123-45-6789".to_string(),
        anonymize: true,
        jurisdictions: vec!["US".to_string()],
    };

    let response = classifier.classify(&request).await.unwrap();

    let redacted = response.data.expect("anonymized text");
    assert!(!redacted.contains("123-45-6789"));
    assert!(response.entity_details.contains_key("US_SSN"));
}

#[test]
fn test_module_exports() {
    use entity_sentry_core::{
        ConfigLoader, EntityKind, JurisdictionKind, RetryPolicy, ValidatorRegistry,
    };

    let config = ConfigLoader::new().load("US").unwrap();
    assert_eq!(config.jurisdiction, "US");

    let mut registry = ValidatorRegistry::with_builtins();
    JurisdictionKind::for_code("US").register_local_validators(&mut registry, "US");

    assert_eq!(EntityKind::from_label("us-ssn"), EntityKind::Ssn);
    assert_eq!(RetryPolicy::default().max_retries, 5);
}
