//! Resolved device records and the JSON handed to subscribers.

use crate::names::ServiceType;
use crate::txt::TxtRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;

/// Browse action a record was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Add,
    Remove,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Remove => "remove",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved service instance.
///
/// Created when name resolution completes and completed with an address in
/// the second stage. Kept by its session, keyed by `full_name`, until the
/// session stops.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    /// Fully qualified instance name as reported by the resolver
    pub full_name: String,
    /// Escape-decoded instance label used to correlate browse events
    pub instance_key: String,
    /// Display name (service type suffix stripped, escapes decoded)
    pub name: String,
    pub service_type: ServiceType,
    /// Host target reported by name resolution
    pub host: String,
    pub txt: TxtRecord,
    pub port: u16,
    pub ip: Option<IpAddr>,
    pub action: Action,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// Record at the end of name resolution; no address yet.
    #[allow(clippy::too_many_arguments)]
    pub fn resolved(
        full_name: impl Into<String>,
        instance_key: impl Into<String>,
        name: impl Into<String>,
        service_type: ServiceType,
        host: impl Into<String>,
        port: u16,
        txt: TxtRecord,
        action: Action,
    ) -> Self {
        Self {
            full_name: full_name.into(),
            instance_key: instance_key.into(),
            name: name.into(),
            service_type,
            host: host.into(),
            txt,
            port,
            ip: None,
            action,
            updated_at: Utc::now(),
        }
    }

    pub fn set_address(&mut self, ip: IpAddr) {
        self.ip = Some(ip);
        self.updated_at = Utc::now();
    }

    pub fn set_action(&mut self, action: Action) {
        self.action = action;
        self.updated_at = Utc::now();
    }

    /// Subscriber payload: every TXT key plus `ip`, `port`, `name`,
    /// `protol` and `action`. The engine fields win over TXT keys of the
    /// same name.
    pub fn to_json_value(&self) -> Value {
        let mut object: Map<String, Value> = self.txt.to_json_map();
        let ip = self.ip.map(|ip| ip.to_string()).unwrap_or_default();

        object.insert("ip".to_string(), Value::String(ip));
        object.insert("port".to_string(), Value::from(self.port));
        object.insert("name".to_string(), Value::String(self.name.clone()));
        object.insert(
            "protol".to_string(),
            Value::String(self.service_type.as_str().to_string()),
        );
        object.insert(
            "action".to_string(),
            Value::String(self.action.as_str().to_string()),
        );

        Value::Object(object)
    }

    pub fn to_json(&self) -> String {
        self.to_json_value().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(txt: TxtRecord) -> DeviceRecord {
        DeviceRecord::resolved(
            "Inst1._svc._tcp.local.",
            "Inst1",
            "Inst1",
            ServiceType::parse("_svc._tcp").unwrap(),
            "h.local.",
            8080,
            txt,
            Action::Add,
        )
    }

    #[test]
    fn test_payload_keeps_txt_keys() {
        let txt: TxtRecord = [("width", "1920"), ("deviceType", "SmartTV")]
            .into_iter()
            .collect();
        let mut device = record(txt);
        device.set_address("10.0.0.5".parse().unwrap());

        let value = device.to_json_value();
        assert_eq!(value["width"], "1920");
        assert_eq!(value["deviceType"], "SmartTV");
        assert_eq!(value["ip"], "10.0.0.5");
        assert_eq!(value["port"], 8080);
        assert_eq!(value["name"], "Inst1");
        assert_eq!(value["protol"], "_svc._tcp");
        assert_eq!(value["action"], "add");
    }

    #[test]
    fn test_engine_fields_override_txt() {
        let txt: TxtRecord = [("port", "1"), ("name", "spoofed")].into_iter().collect();
        let value = record(txt).to_json_value();

        assert_eq!(value["port"], 8080);
        assert_eq!(value["name"], "Inst1");
        assert_eq!(value["ip"], "");
    }

    #[test]
    fn test_remove_action() {
        let mut device = record(TxtRecord::new());
        device.set_action(Action::Remove);
        assert!(device.to_json().contains(r#""action":"remove""#));
    }
}
