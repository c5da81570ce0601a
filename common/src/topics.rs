pub const TOPIC_CMD_INTENSITY: &str = "heating/cmnd/intensity";

pub const TOPIC_STATE_INTENSITY: &str = "heating/state/intensity";
pub const TOPIC_STATE: &str = "heating/state";
pub const TOPIC_STATUS: &str = "heating/status";
