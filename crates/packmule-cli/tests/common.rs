use assert_cmd::assert::Assert;
use serde_json::Value;

#[allow(dead_code)]
pub fn parse_json(assert: &Assert) -> Value {
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout);
    serde_json::from_str(stdout.trim())
        .unwrap_or_else(|err| panic!("stdout is not JSON ({err}): {stdout}"))
}
