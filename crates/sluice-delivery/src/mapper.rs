//! Mapping a merged outbox record onto a FHIR `Patient` resource.
//!
//! The merged record uses the flat column names written by the triggers
//! (`name_family`, `address_city`, ...). Empty strings and `null` are treated
//! as absent; numbers are accepted where text is expected.

use serde::Serialize;
use serde_json::Value;

use crate::merge::MergedRecord;

/// FHIR `Patient` resource as sent to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientResource {
    /// Always `"Patient"`.
    pub resource_type: &'static str,
    /// Business identifiers, primary first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,
    /// Human names.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub name: Vec<HumanName>,
    /// `YYYY-MM-DD` birth date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,
    /// Administrative gender code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    /// Phone and email contacts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub telecom: Vec<ContactPoint>,
    /// Postal addresses.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub address: Vec<Address>,
}

/// `system`/`value` identifier pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identifier {
    /// Namespace of the value.
    pub system: String,
    /// Identifier value.
    pub value: String,
}

/// FHIR `HumanName`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HumanName {
    /// Family name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    /// Given names in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub given: Vec<String>,
    /// Full display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// FHIR `ContactPoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactPoint {
    /// `phone` or `email`.
    pub system: &'static str,
    /// Number or address.
    pub value: String,
}

/// FHIR `Address`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    /// Street lines.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub line: Vec<String>,
    /// City.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// State or province.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Postal code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    /// Country.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl PatientResource {
    /// Identifier used for the conditional write, if any.
    pub fn primary_identifier(&self) -> Option<&Identifier> {
        self.identifier.first()
    }
}

/// Builds the `Patient` resource for a merged record.
pub fn build_patient_resource(record: &MergedRecord) -> PatientResource {
    PatientResource {
        resource_type: "Patient",
        identifier: identifiers(record),
        name: human_name(record).into_iter().collect(),
        birth_date: text(record, "birth_date"),
        gender: text(record, "gender"),
        telecom: telecom(record),
        address: address(record).into_iter().collect(),
    }
}

fn identifiers(record: &MergedRecord) -> Vec<Identifier> {
    let mut identifiers = Vec::new();

    if let Some(primary) = identifier_pair(record) {
        identifiers.push(primary);
    }

    if let Some(Value::Array(others)) = record.get("other_identifiers") {
        identifiers.extend(others.iter().filter_map(|other| match other {
            Value::Object(fields) => identifier_pair(fields),
            _ => None,
        }));
    }

    identifiers
}

fn identifier_pair(fields: &MergedRecord) -> Option<Identifier> {
    Some(Identifier {
        system: text(fields, "identifier_system")?,
        value: text(fields, "identifier_value")?,
    })
}

fn human_name(record: &MergedRecord) -> Option<HumanName> {
    let family = text(record, "name_family");
    let given = texts(record, "name_given");
    let text_value = text(record, "name_text");

    if family.is_none() && given.is_empty() && text_value.is_none() {
        return None;
    }

    let text_value = text_value.or_else(|| {
        let parts: Vec<&str> =
            given.iter().map(String::as_str).chain(family.as_deref()).collect();
        Some(parts.join(" ").trim().to_string())
    });

    Some(HumanName { family, given, text: text_value })
}

fn telecom(record: &MergedRecord) -> Vec<ContactPoint> {
    [("phone_number", "phone"), ("email", "email")]
        .into_iter()
        .filter_map(|(field, system)| {
            text(record, field).map(|value| ContactPoint { system, value })
        })
        .collect()
}

fn address(record: &MergedRecord) -> Option<Address> {
    let address = Address {
        line: texts(record, "address_line"),
        city: text(record, "address_city"),
        state: text(record, "address_state"),
        postal_code: text(record, "address_postal_code"),
        country: text(record, "address_country"),
    };

    (address != Address::default()).then_some(address)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text(record: &MergedRecord, key: &str) -> Option<String> {
    record.get(key).and_then(scalar_text)
}

fn texts(record: &MergedRecord, key: &str) -> Vec<String> {
    match record.get(key) {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
        Some(value) => scalar_text(value).into_iter().collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> MergedRecord {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test records are objects"),
        }
    }

    #[test]
    fn empty_record_is_bare_patient() {
        let resource = build_patient_resource(&MergedRecord::new());
        assert_eq!(serde_json::to_value(&resource).unwrap(), json!({"resourceType": "Patient"}));
        assert!(resource.primary_identifier().is_none());
    }

    #[test]
    fn full_record_maps_every_section() {
        let resource = build_patient_resource(&record(json!({
            "identifier_system": "urn:mrn",
            "identifier_value": "123",
            "other_identifiers": [
                {"identifier_system": "urn:ssn", "identifier_value": "999"},
                {"identifier_system": "urn:incomplete"}
            ],
            "name_family": "Doe",
            "name_given": "Jane",
            "birth_date": "1990-04-01",
            "gender": "female",
            "phone_number": "+1-555-0100",
            "email": "jane@example.org",
            "address_line": "1 Main St",
            "address_city": "Springfield",
            "address_state": "IL",
            "address_postal_code": "62701",
            "address_country": "US"
        })));

        assert_eq!(
            serde_json::to_value(&resource).unwrap(),
            json!({
                "resourceType": "Patient",
                "identifier": [
                    {"system": "urn:mrn", "value": "123"},
                    {"system": "urn:ssn", "value": "999"}
                ],
                "name": [{"family": "Doe", "given": ["Jane"], "text": "Jane Doe"}],
                "birthDate": "1990-04-01",
                "gender": "female",
                "telecom": [
                    {"system": "phone", "value": "+1-555-0100"},
                    {"system": "email", "value": "jane@example.org"}
                ],
                "address": [{
                    "line": ["1 Main St"],
                    "city": "Springfield",
                    "state": "IL",
                    "postalCode": "62701",
                    "country": "US"
                }]
            })
        );
    }

    #[test]
    fn explicit_name_text_is_kept() {
        let resource = build_patient_resource(&record(json!({
            "name_given": ["Mary", "Ann"],
            "name_text": "Dr. Mary Ann"
        })));

        let name = &resource.name[0];
        assert_eq!(name.given, vec!["Mary", "Ann"]);
        assert_eq!(name.text.as_deref(), Some("Dr. Mary Ann"));
        assert_eq!(name.family, None);
    }

    #[test]
    fn synthesized_text_handles_missing_given() {
        let resource = build_patient_resource(&record(json!({"name_family": "Doe"})));
        assert_eq!(resource.name[0].text.as_deref(), Some("Doe"));
    }

    #[test]
    fn primary_identifier_requires_both_halves() {
        let resource = build_patient_resource(&record(json!({
            "identifier_system": "urn:mrn",
            "identifier_value": ""
        })));
        assert!(resource.identifier.is_empty());
    }

    #[test]
    fn numeric_identifier_values_are_stringified() {
        let resource = build_patient_resource(&record(json!({
            "identifier_system": "sys",
            "identifier_value": 123
        })));
        assert_eq!(
            resource.primary_identifier(),
            Some(&Identifier { system: "sys".into(), value: "123".into() })
        );
    }

    #[test]
    fn null_fields_are_absent() {
        let resource = build_patient_resource(&record(json!({
            "gender": null,
            "address_city": null,
            "email": ""
        })));
        assert_eq!(resource.gender, None);
        assert!(resource.address.is_empty());
        assert!(resource.telecom.is_empty());
    }
}
