mod common;

#[cfg(test)]
mod tests {
    use crate::common::{spawn_server, ServerMode};
    use std::process::Command;

    fn echo_stress() -> Command {
        Command::new(env!("CARGO_BIN_EXE_echo-stress"))
    }

    #[test]
    pub fn test_usage_error_exits_with_one() {
        let output = echo_stress().args(["127.0.0.1", "9000"]).output().unwrap();
        assert_eq!(output.status.code(), Some(1));
        assert!(output.stdout.is_empty());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("Usage"), "{stderr}");
    }

    #[test]
    pub fn test_zero_duration_exits_with_one() {
        let output = echo_stress()
            .args(["127.0.0.1", "9000", "1", "0"])
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(1));
        assert!(output.stdout.is_empty());
    }

    #[test]
    pub fn test_huge_duration_exits_with_one() {
        let output = echo_stress()
            .args(["127.0.0.1", "9000", "1", "9223372036854775807"])
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(1));
        assert!(output.stdout.is_empty());
    }

    #[test]
    pub fn test_report_is_printed() {
        let addr = spawn_server(ServerMode::Echo);
        let port = addr.port().to_string();
        let output = echo_stress()
            .args(["127.0.0.1", port.as_str(), "2", "1"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let stdout = String::from_utf8(output.stdout).unwrap();
        let lines: Vec<_> = stdout.lines().collect();
        assert_eq!(lines.len(), 5, "{stdout}");
        assert_eq!(lines[0], "Test results:");
        assert_eq!(lines[1], "Total messages sent: 20");
        assert!(lines[2].starts_with("Average duration per client: "));
        assert!(lines[3].starts_with("Throughput (messages per second): "));
        assert_eq!(lines[4], "Success rate: 100.00%");
    }
}
