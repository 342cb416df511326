//! # Connections Module
//!
//! This module handles the outbound connection to the MQTT broker the latest
//! magnetometer record is published to.

/// MQTT publishing with acknowledgement tracking.
pub mod mqtt_publisher;

pub use mqtt_publisher::{
    ConnectionState, Delivery, MqttPublisher, PublishError, RecordPublisher,
    UNCONFIRMED_DELIVERY_MARKER,
};
