//! Shared librdkafka client settings.

use crate::config::BrokerConfig;
use rdkafka::config::ClientConfig;

/// Client configuration with bootstrap servers, timeouts and security applied.
pub(crate) fn base_config(broker: &BrokerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", broker.bootstrap_servers.join(","))
        .set(
            "socket.connection.setup.timeout.ms",
            broker.connect_timeout_ms.to_string(),
        )
        .set("session.timeout.ms", broker.session_timeout_ms.to_string());

    let security = &broker.security;
    if let Some(ref protocol) = security.protocol {
        client_config.set("security.protocol", protocol);
    }
    if let Some(ref mechanism) = security.sasl_mechanism {
        client_config.set("sasl.mechanism", mechanism);
    }
    if let Some(ref username) = security.sasl_username {
        client_config.set("sasl.username", username);
    }
    if let Some(ref password) = security.sasl_password {
        client_config.set("sasl.password", password);
    }
    if let Some(ref path) = security.ssl_ca_location {
        client_config.set("ssl.ca.location", path.to_string_lossy().as_ref());
    }
    if let Some(ref path) = security.ssl_cert_location {
        client_config.set("ssl.certificate.location", path.to_string_lossy().as_ref());
    }
    if let Some(ref path) = security.ssl_key_location {
        client_config.set("ssl.key.location", path.to_string_lossy().as_ref());
    }

    client_config
}

/// Consumer settings for manually assigned, manually committed reads.
pub(crate) fn consumer_config(broker: &BrokerConfig, group_id: &str) -> ClientConfig {
    let mut client_config = base_config(broker);
    client_config
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false");
    client_config
}

/// Comma-joined bootstrap list, for error messages.
pub(crate) fn broker_list(broker: &BrokerConfig) -> String {
    broker.bootstrap_servers.join(",")
}
