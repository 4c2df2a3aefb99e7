//! Factories for records and API requests

use chrono::{Duration, Utc};
use rustc_hash::FxHashMap;
use uuid::Uuid;

use services_common::models::{InstanceRecord, InstanceStatus, RegisterRequest};

/// A healthy instance record for `service` at `host:port`
#[must_use]
pub fn instance_record(service: &str, host: &str, port: u16) -> InstanceRecord {
    let now = Utc::now();
    InstanceRecord {
        instance_id: Uuid::new_v4(),
        service_name: service.to_string(),
        host: host.to_string(),
        port,
        version_tag: "1.0.0".to_string(),
        metadata: FxHashMap::default(),
        health_check_url: None,
        weight: 100,
        registered_at: now,
        last_heartbeat: now,
        status: InstanceStatus::Healthy,
    }
}

/// A record whose heartbeat is `age_secs` old
#[must_use]
pub fn stale_instance_record(service: &str, age_secs: i64) -> InstanceRecord {
    let mut record = instance_record(service, "127.0.0.1", 9000);
    record.last_heartbeat = Utc::now() - Duration::seconds(age_secs);
    record.registered_at = record.last_heartbeat;
    record
}

/// A minimal register request
#[must_use]
pub fn register_request(service: &str, host: &str, port: u16) -> RegisterRequest {
    RegisterRequest {
        service_name: service.to_string(),
        host: host.to_string(),
        port,
        version: Some("1.0.0".to_string()),
        metadata: FxHashMap::default(),
        health_check_url: None,
        weight: Some(100),
        instance_id: None,
    }
}
