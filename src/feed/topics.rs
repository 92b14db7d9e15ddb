use kinfeed_api_types::UserId;

use crate::broker::ConsumerSpec;

const USER_ID: &str = "{user_id}";
const INSTANCE_ID: &str = "{instance_id}";

/// Names of the per-user update channel, rendered from templates holding
/// `{user_id}` and `{instance_id}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTopics {
    pub routing_key: String,
    pub queue: String,
    pub consumer_tag: String,
    pub instance_id: String,
}

impl UserTopics {
    pub fn routing_key(&self, user: UserId) -> String {
        self.render(&self.routing_key, user)
    }

    /// Queue and tag are unique per user and per process, and the queue goes
    /// away with its consumer.
    pub fn consumer_spec(&self, user: UserId) -> ConsumerSpec {
        ConsumerSpec {
            queue: self.render(&self.queue, user),
            tag: self.render(&self.consumer_tag, user),
            routing_key: self.routing_key(user),
            durable: false,
        }
    }

    fn render(&self, template: &str, user: UserId) -> String {
        template
            .replace(USER_ID, &user.to_string())
            .replace(INSTANCE_ID, &self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn renders_user_and_instance() {
        let topics = UserTopics {
            routing_key: "feed.user.{user_id}".into(),
            queue: "feed.user.{user_id}.{instance_id}".into(),
            consumer_tag: "live-{instance_id}-{user_id}".into(),
            instance_id: "node-1".into(),
        };
        let user = UserId(Uuid::nil());
        let spec = topics.consumer_spec(user);
        assert_eq!(
            spec.routing_key,
            "feed.user.00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            spec.queue,
            "feed.user.00000000-0000-0000-0000-000000000000.node-1"
        );
        assert_eq!(
            spec.tag,
            "live-node-1-00000000-0000-0000-0000-000000000000"
        );
        assert!(!spec.durable);
    }
}
