use fleet::inventory::Inventory;
use fleet::schema::{schema_json, validate_inventory_yaml};

#[test]
fn schema_accepts_fixture_inventory() {
    let doc = include_str!("fixtures/inventory.yaml");
    validate_inventory_yaml(doc).expect("fixture inventory should validate against schema");
}

#[test]
fn fixture_inventory_parses_into_hosts() {
    // Schema and structs must agree on what a valid inventory is.
    let doc = include_str!("fixtures/inventory.yaml");
    let inventory = Inventory::parse(doc).expect("fixture inventory should parse");
    assert_eq!(inventory.limit, Some(3));

    let hosts = inventory.into_hosts().expect("fixture aliases are unique");
    assert_eq!(hosts.aliases(), vec!["web1", "web2", "web3"]);
    assert_eq!(hosts.get("web3").unwrap().node_key(), "n2");
}

#[test]
fn schema_rejects_unknown_top_level_fields() {
    let bad = r#"
hosts: []
parallel: 4
"#;
    let err = validate_inventory_yaml(bad).unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("schema validation failed"), "{msg}");
}

#[test]
fn schema_rejects_host_without_alias() {
    let bad = r#"
hosts:
  - hostname: 10.0.0.1
"#;
    let err = validate_inventory_yaml(bad).unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("alias"), "{msg}");
}

#[test]
fn schema_rejects_non_string_labels() {
    let bad = r#"
hosts:
  - alias: web1
    labels: { weight: [1, 2] }
"#;
    assert!(validate_inventory_yaml(bad).is_err());
}

#[test]
fn empty_inventory_is_valid() {
    let inventory = Inventory::parse("{}").expect("empty mapping is a valid inventory");
    assert!(inventory.hosts.is_empty());
    assert_eq!(inventory.limit, None);
}

#[test]
fn published_schema_names_every_host_field() {
    let text = schema_json().to_string();
    for field in ["alias", "hostname", "labels", "config", "limit"] {
        assert!(text.contains(field), "schema is missing '{field}'");
    }
}
