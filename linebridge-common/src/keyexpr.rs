/// Default key expression prefix for the OPC UA bridge.
pub const DEFAULT_KEY_PREFIX: &str = "linebridge/opcua";

/// Builder for the bridge's key expressions.
///
/// Key expressions follow the pattern:
/// `<prefix>/<device>/<channel>` for per-device traffic and
/// `<prefix>/@/<channel>` for administrative traffic.
#[derive(Debug, Clone)]
pub struct KeyExprBuilder {
    prefix: String,
}

impl Default for KeyExprBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeyExprBuilder {
    /// Create a builder with a custom prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// The prefix every key starts with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key for periodic telemetry of a device.
    ///
    /// # Example
    /// ```
    /// use linebridge_common::keyexpr::KeyExprBuilder;
    ///
    /// let builder = KeyExprBuilder::default();
    /// assert_eq!(builder.telemetry_key("Device 1"), "linebridge/opcua/Device_1/telemetry");
    /// ```
    pub fn telemetry_key(&self, device: &str) -> String {
        format!("{}/{}/telemetry", self.prefix, device_segment(device))
    }

    /// Key for rising-edge error events of a device.
    pub fn error_key(&self, device: &str) -> String {
        format!("{}/{}/error", self.prefix, device_segment(device))
    }

    /// Key for desired-property updates addressed to a device.
    pub fn desired_key(&self, device: &str) -> String {
        format!("{}/{}/desired", self.prefix, device_segment(device))
    }

    /// Wildcard matching desired-property updates for every device.
    pub fn desired_wildcard(&self) -> String {
        format!("{}/*/desired", self.prefix)
    }

    /// Queryable key for direct-method commands.
    pub fn command_key(&self) -> String {
        format!("{}/@/commands", self.prefix)
    }

    /// Key for bridge status announcements.
    pub fn status_key(&self) -> String {
        format!("{}/@/status", self.prefix)
    }

    /// Extract the device segment from a `<prefix>/<device>/desired` key.
    ///
    /// Returns `None` if the key does not belong to this prefix or channel.
    pub fn parse_desired_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let segment = rest.strip_suffix("/desired")?;
        if segment.is_empty() || segment.contains('/') {
            return None;
        }
        Some(segment)
    }
}

/// Turn a device name into a single key-expression segment.
///
/// Characters that are separators or special in key expressions
/// (`/ * $ ? #` and whitespace) are replaced by `_`.
pub fn device_segment(name: &str) -> String {
    let segment: String = name
        .chars()
        .map(|c| match c {
            '/' | '*' | '$' | '?' | '#' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    if segment.is_empty() {
        "_".to_string()
    } else {
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_builder() {
        let builder = KeyExprBuilder::new("plant/line3/");

        assert_eq!(builder.prefix(), "plant/line3");
        assert_eq!(
            builder.telemetry_key("Device 1"),
            "plant/line3/Device_1/telemetry"
        );
        assert_eq!(builder.error_key("Device 1"), "plant/line3/Device_1/error");
        assert_eq!(builder.command_key(), "plant/line3/@/commands");
        assert_eq!(builder.status_key(), "plant/line3/@/status");
        assert_eq!(builder.desired_wildcard(), "plant/line3/*/desired");
    }

    #[test]
    fn test_device_segment_sanitizes() {
        assert_eq!(device_segment("Device 1"), "Device_1");
        assert_eq!(device_segment("a/b*c"), "a_b_c");
        assert_eq!(device_segment(""), "_");
        assert_eq!(device_segment("Press-07"), "Press-07");
    }

    #[test]
    fn test_parse_desired_key() {
        let builder = KeyExprBuilder::default();

        assert_eq!(
            builder.parse_desired_key("linebridge/opcua/Device_1/desired"),
            Some("Device_1")
        );
        assert_eq!(
            builder.parse_desired_key("linebridge/opcua/Device_1/telemetry"),
            None
        );
        assert_eq!(builder.parse_desired_key("other/opcua/Device_1/desired"), None);
        assert_eq!(builder.parse_desired_key("linebridge/opcua/desired"), None);
    }
}
