//! Backplane topic names

use crate::connection::ConnectionId;

/// Builds every topic name under one prefix
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new<T: Into<String>>(prefix: T) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn all(&self) -> String {
        format!("{}:all", self.prefix)
    }

    pub fn group(&self, group: &str) -> String {
        format!("{}:group:{}", self.prefix, group)
    }

    pub fn user(&self, user_id: &str) -> String {
        format!("{}:user:{}", self.prefix, user_id)
    }

    pub fn connection(&self, connection_id: &ConnectionId) -> String {
        format!("{}:connection:{}", self.prefix, connection_id)
    }

    /// Group membership commands for connections owned elsewhere
    pub fn group_management(&self) -> String {
        format!("{}:internal:groups", self.prefix)
    }

    pub fn ack(&self, server_id: &str) -> String {
        format!("{}:internal:ack:{}", self.prefix, server_id)
    }

    /// Client results routed back to the invoking server
    pub fn return_results(&self, server_id: &str) -> String {
        format!("{}:internal:return:{}", self.prefix, server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names_are_prefixed() {
        let topics = Topics::new("chat");
        assert_eq!(topics.all(), "chat:all");
        assert_eq!(topics.group("lobby"), "chat:group:lobby");
        assert_eq!(topics.user("alice"), "chat:user:alice");
        assert_eq!(
            topics.connection(&ConnectionId::from("abc")),
            "chat:connection:abc"
        );
        assert_eq!(topics.ack("s1"), "chat:internal:ack:s1");
        assert_eq!(topics.return_results("s1"), "chat:internal:return:s1");
    }
}
