//! Agent-wrapped container commands

use crate::api::types::ContainerConfig;

/// Agent binary path inside agent-enabled images
pub const AGENT_BIN: &str = "/sockerless/bin/sockerless-agent";

/// Port the agent listens on in forward mode
pub const AGENT_PORT: &str = "9111";

/// Entrypoint followed by cmd
pub fn build_original_command(entrypoint: &[String], cmd: &[String]) -> Vec<String> {
    entrypoint.iter().chain(cmd.iter()).cloned().collect()
}

/// Whether the command is an idle `tail -f /dev/null`, bare or via a shell
pub fn is_tail_dev_null(entrypoint: &[String], cmd: &[String]) -> bool {
    let combined = build_original_command(entrypoint, cmd);
    if combined.len() != 3 {
        return false;
    }
    if combined[0] == "tail" && combined[1] == "-f" && combined[2] == "/dev/null" {
        return true;
    }
    let shell = matches!(combined[0].as_str(), "sh" | "/bin/sh" | "bash" | "/bin/bash");
    shell
        && combined[1] == "-c"
        && matches!(combined[2].as_str(), "tail -f /dev/null" | "tail -f /dev/null\n")
}

fn keep_alive_prefix(mode_flag: &str, mode_value: &str) -> Vec<String> {
    vec![
        AGENT_BIN.to_string(),
        mode_flag.to_string(),
        mode_value.to_string(),
        "--keep-alive".to_string(),
        "--".to_string(),
    ]
}

/// Wrap the container command with a listening agent in keep-alive mode.
///
/// Returns `(entrypoint, cmd)`; the command is folded into the entrypoint.
pub fn build_agent_entrypoint(config: &ContainerConfig) -> (Vec<String>, Vec<String>) {
    let mut args = keep_alive_prefix("--addr", &format!(":{}", AGENT_PORT));
    if is_tail_dev_null(&config.entrypoint, &config.cmd) {
        args.extend(["tail", "-f", "/dev/null"].map(String::from));
        return (args, Vec::new());
    }
    let original = build_original_command(&config.entrypoint, &config.cmd);
    if original.is_empty() {
        args.push("/bin/sh".to_string());
    } else {
        args.extend(original);
    }
    (args, Vec::new())
}

/// Wrap the container command with an agent that dials back to `callback_url`
pub fn build_agent_callback_entrypoint(config: &ContainerConfig, callback_url: &str) -> Vec<String> {
    let mut args = keep_alive_prefix("--callback", callback_url);
    let original = build_original_command(&config.entrypoint, &config.cmd);
    if original.is_empty() {
        args.push("/bin/sh".to_string());
    } else {
        args.extend(original);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_is_tail_dev_null_variants() {
        assert!(is_tail_dev_null(&[], &strings(&["tail", "-f", "/dev/null"])));
        assert!(is_tail_dev_null(
            &strings(&["/bin/sh", "-c"]),
            &strings(&["tail -f /dev/null"])
        ));
        assert!(!is_tail_dev_null(&[], &strings(&["tail", "-F", "/dev/null"])));
        assert!(!is_tail_dev_null(&[], &[]));
    }

    #[test]
    fn test_build_agent_entrypoint() {
        let config = ContainerConfig {
            cmd: strings(&["tail", "-f", "/dev/null"]),
            ..Default::default()
        };
        let (ep, cmd) = build_agent_entrypoint(&config);
        assert_eq!(ep[0], AGENT_BIN);
        assert_eq!(ep[1..3], strings(&["--addr", ":9111"]));
        assert_eq!(ep[ep.len() - 3..], strings(&["tail", "-f", "/dev/null"]));
        assert!(cmd.is_empty());

        let (ep, _) = build_agent_entrypoint(&ContainerConfig::default());
        assert_eq!(ep.last().unwrap(), "/bin/sh");
    }

    #[test]
    fn test_build_agent_callback_entrypoint() {
        let config = ContainerConfig {
            entrypoint: strings(&["python"]),
            cmd: strings(&["app.py"]),
            ..Default::default()
        };
        let ep = build_agent_callback_entrypoint(&config, "ws://host/agent/connect");
        assert_eq!(
            ep,
            strings(&[
                AGENT_BIN,
                "--callback",
                "ws://host/agent/connect",
                "--keep-alive",
                "--",
                "python",
                "app.py"
            ])
        );
    }
}
