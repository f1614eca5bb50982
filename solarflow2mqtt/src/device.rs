use serde_derive::Deserialize;

/// Identity of the bridged device as configured at startup.
///
/// All vendor topics are derived from it; it never changes at runtime.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub topic_prefix: String,
    pub device_id: String,
}

impl DeviceIdentity {
    pub fn new(topic_prefix: &str, device_id: &str) -> Self {
        Self {
            topic_prefix: topic_prefix.to_string(),
            device_id: device_id.to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.topic_prefix.is_empty() && !self.device_id.is_empty()
    }

    pub fn topic(&self, suffix: &str) -> String {
        format!("/{}/{}/{}", self.topic_prefix, self.device_id, suffix)
    }

    pub fn report_topic(&self) -> String {
        self.topic("properties/report")
    }

    pub fn write_topic(&self) -> String {
        self.topic("properties/write")
    }

    pub fn write_reply_topic(&self) -> String {
        self.topic("properties/write/reply")
    }

    pub fn read_topic(&self) -> String {
        self.topic("properties/read")
    }

    pub fn time_request_topic(&self) -> String {
        self.topic("time/request")
    }

    pub fn time_reply_topic(&self) -> String {
        self.topic("time/reply")
    }

    pub fn firmware_topic(&self) -> String {
        self.topic("firmware/report")
    }

    pub fn log_topic(&self) -> String {
        self.topic("log")
    }

    /// Topics the device publishes on.
    pub fn inbound_topics(&self) -> Vec<String> {
        vec![
            self.report_topic(),
            self.time_request_topic(),
            self.write_reply_topic(),
            self.firmware_topic(),
            self.log_topic(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_topics_are_rooted_at_prefix_and_id() {
        let identity = DeviceIdentity::new("73bkTV", "5ak8yGU7");
        assert_eq!(identity.report_topic(), "/73bkTV/5ak8yGU7/properties/report");
        assert_eq!(identity.time_reply_topic(), "/73bkTV/5ak8yGU7/time/reply");
        assert_eq!(identity.inbound_topics().len(), 5);
    }

    #[test]
    fn empty_identity_is_invalid() {
        assert!(!DeviceIdentity::default().is_valid());
        assert!(!DeviceIdentity::new("73bkTV", "").is_valid());
    }
}
