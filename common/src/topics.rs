pub const PUB_TOPIC_PREFIX: &str = "status";
pub const SUB_TOPIC_PREFIX: &str = "cmd";

pub const UNIVERSAL_DEVICE_ID: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub publish: String,
    pub subscribe: String,
    pub broadcast: String,
}

impl Topics {
    pub fn compose(org_id: &str, app_id: &str, group_id: &str, mac: &str) -> Self {
        let topic =
            |kind: &str, device: &str| format!("{org_id}/{app_id}/{kind}/{group_id}/{device}");
        Self {
            publish: topic(PUB_TOPIC_PREFIX, mac),
            subscribe: topic(SUB_TOPIC_PREFIX, mac),
            broadcast: topic(SUB_TOPIC_PREFIX, UNIVERSAL_DEVICE_ID),
        }
    }

    pub fn subscriptions(&self) -> [&str; 2] {
        [&self.subscribe, &self.broadcast]
    }
}
