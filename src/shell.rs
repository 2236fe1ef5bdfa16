use std::process::Command;

use anyhow::Context;

use crate::host::Host;
use crate::task::TaskError;

/// Replace `{{key}}` placeholders with host values.
///
/// `alias` and `hostname` resolve to the host identity; every other key is
/// looked up in the host config. Unknown keys are an error.
pub fn render(template: &str, host: &Host) -> Result<String, TaskError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(TaskError::exit(
                1,
                format!("unterminated placeholder in '{template}'"),
            ));
        };
        let key = after[..end].trim();
        out.push_str(&lookup(key, host).ok_or_else(|| {
            TaskError::exit(
                1,
                format!("host '{}' has no config value for '{key}'", host.alias()),
            )
        })?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn lookup(key: &str, host: &Host) -> Option<String> {
    match key {
        "alias" => Some(host.alias().to_string()),
        "hostname" => Some(host.hostname().to_string()),
        _ => match host.config().get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        },
    }
}

/// Run `command` through `sh -c` on behalf of `host`.
///
/// Each stdout line is echoed as `[alias] line`; the trimmed stdout is
/// returned. A nonzero exit becomes [`TaskError::Exit`] carrying the code.
pub fn run_local(host: &Host, command: &str) -> Result<String, TaskError> {
    let rendered = render(command, host)?;
    tracing::debug!(host = host.alias(), command = %rendered, "run");

    let output = Command::new("sh")
        .arg("-c")
        .arg(&rendered)
        .output()
        .with_context(|| format!("failed to run `{rendered}`"))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        println!("[{}] {line}", host.alias());
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            eprintln!("[{}] {line}", host.alias());
        }
        return Err(TaskError::exit(
            output.status.code().unwrap_or(1),
            format!("command `{rendered}` failed: {}", stderr.trim()),
        ));
    }
    Ok(stdout.trim_end().to_string())
}
