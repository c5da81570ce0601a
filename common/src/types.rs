use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub value: i32,
    #[serde(rename = "minValue")]
    pub min_value: i32,
    #[serde(rename = "maxValue")]
    pub max_value: i32,
    pub authority: &'static str,
    #[serde(rename = "inputKind")]
    pub input_kind: &'static str,
    #[serde(rename = "outputKind")]
    pub output_kind: &'static str,
    #[serde(rename = "lastLocalReading")]
    pub last_local_reading: Option<i32>,
    #[serde(rename = "remoteCommands")]
    pub remote_commands: u64,
    #[serde(rename = "localSteps")]
    pub local_steps: u64,
}
