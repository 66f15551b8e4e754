pub const TOPIC_CONTROLLER_STATUS: &str = "RAPT/temperatureController";
pub const TOPIC_CONTROLLER_COMMAND: &str = "RAPT/temperatureController/Command";
