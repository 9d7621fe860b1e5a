#![cfg(feature = "test-support")]

use std::io::{BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};

use sim_agent_bridge::{ConnectionConfig, MemoryHost};
use tempfile::NamedTempFile;

pub fn fake_agent_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_fake_agent") {
        return PathBuf::from(path);
    }

    // Fallback to the workspace target directory.
    let mut path = std::env::current_exe().expect("current exe");
    path.pop(); // deps
    path.pop(); // debug or release
    path.push("fake_agent");
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}

pub fn loopback() -> ConnectionConfig {
    ConnectionConfig::new(0).with_host("127.0.0.1")
}

pub fn decision_host(observations: &[(&str, f64)]) -> MemoryHost {
    let mut host = MemoryHost::new()
        .with_state("Status", 0.0)
        .with_state("EpisodeNumber", 1.0)
        .with_state("Reward", 0.0)
        .with_state("Action", -1.0);
    for (name, value) in observations {
        host.set(*name, *value);
    }
    host
}

/// Running `fake_agent` process plus the script file it reads.
pub struct ScriptedAgent {
    child: Child,
    stdout: BufReader<ChildStdout>,
    _script: NamedTempFile,
}

impl ScriptedAgent {
    pub fn spawn(addr: SocketAddr, script: &[&str]) -> Self {
        let mut file = NamedTempFile::new().expect("temp script");
        for line in script {
            writeln!(file, "{line}").expect("write script line");
        }
        file.flush().expect("flush script");

        let mut child = Command::new(fake_agent_path())
            .arg(addr.to_string())
            .arg(file.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("fake agent should launch");
        let stdout = BufReader::new(child.stdout.take().expect("captured stdout"));

        Self {
            child,
            stdout,
            _script: file,
        }
    }

    /// Wait for the process to exit and return every line it printed.
    pub fn finish(mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut line = String::new();
        while self.stdout.read_line(&mut line).expect("read agent output") > 0 {
            lines.push(line.trim().to_string());
            line.clear();
        }
        let status = self.child.wait().expect("agent exit status");
        assert!(status.success(), "fake agent failed: {status:?}\n{lines:#?}");
        lines
    }

    /// Request payloads the agent saw, in arrival order.
    pub fn requests(lines: &[String]) -> Vec<serde_json::Value> {
        lines
            .iter()
            .filter_map(|line| line.strip_prefix("request "))
            .map(|payload| serde_json::from_str(payload).expect("request is JSON"))
            .collect()
    }
}

impl Drop for ScriptedAgent {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
