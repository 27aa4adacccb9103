//! Per-run host resources derived from the run id, so two concurrent runs
//! never collide on a MAC address or display port.

use std::collections::BTreeMap;

use sha2::{Digest as _, Sha256};

const DISPLAY_BASE_PORT: u32 = 5900;
const DISPLAYS_PER_RUN: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunIdentity {
    run_id: u32,
}

impl RunIdentity {
    pub fn new(run_id: u32) -> Self {
        Self { run_id }
    }

    pub fn run_id(&self) -> u32 {
        self.run_id
    }

    /// Locally administered QEMU-prefix MAC, stable for a (run, vm) pair.
    pub fn mac(&self, vm: &str) -> String {
        let mut h = Sha256::new();
        h.update(self.run_id.to_be_bytes());
        h.update(b"\0");
        h.update(vm.as_bytes());
        let d = h.finalize();
        format!("52:54:00:{:02x}:{:02x}:{:02x}", d[0], d[1], d[2])
    }

    /// VNC-style port for the `index`-th VM of this run.
    pub fn display_port(&self, index: u32) -> u16 {
        let port = DISPLAY_BASE_PORT
            + self.run_id.saturating_mul(DISPLAYS_PER_RUN)
            + index % DISPLAYS_PER_RUN;
        u16::try_from(port).unwrap_or(u16::MAX)
    }
}

/// `{name}` substitutions applied to a VM's argv.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    values: BTreeMap<String, String>,
}

impl Placeholders {
    pub fn for_vm(identity: RunIdentity, vm: &str, index: u32) -> Self {
        let mut p = Placeholders::default();
        p.set("run_id", identity.run_id().to_string());
        p.set("vm", vm);
        p.set("mac", identity.mac(vm));
        p.set("display_port", identity.display_port(index).to_string());
        p
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn set_forwards(&mut self, host_ports: &[u16]) -> &mut Self {
        for (i, port) in host_ports.iter().enumerate() {
            self.set(&format!("fwd{i}"), port.to_string());
        }
        self
    }

    /// Replaces every known `{key}`; unknown braces are left alone.
    pub fn expand(&self, arg: &str) -> String {
        let mut out = String::with_capacity(arg.len());
        let mut rest = arg;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if self.values.contains_key(&after[..close]) => {
                    out.push_str(&self.values[&after[..close]]);
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }

    pub fn expand_argv(&self, argv: &[String]) -> Vec<String> {
        argv.iter().map(|a| self.expand(a)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_deterministic_and_distinct() {
        let a = RunIdentity::new(3);
        assert_eq!(a.mac("studio"), RunIdentity::new(3).mac("studio"));
        assert_ne!(a.mac("studio"), a.mac("client1"));
        assert_ne!(a.mac("studio"), RunIdentity::new(4).mac("studio"));
        assert!(a.mac("studio").starts_with("52:54:00:"));
        assert_eq!(a.mac("studio").len(), 17);
    }

    #[test]
    fn display_ports_do_not_overlap_between_runs() {
        let r1 = RunIdentity::new(1);
        let r2 = RunIdentity::new(2);
        let p1: Vec<u16> = (0..DISPLAYS_PER_RUN).map(|i| r1.display_port(i)).collect();
        assert!(!p1.contains(&r2.display_port(0)));
        assert_eq!(r1.display_port(0), 5916);
    }

    #[test]
    fn expands_known_placeholders_only() {
        let mut p = Placeholders::for_vm(RunIdentity::new(7), "c1", 1);
        p.set("ctl_fd", "9").set_forwards(&[40001, 40002]);

        let argv: Vec<String> = [
            "-name",
            "hck-{run_id}-{vm}",
            "-chardev",
            "socket,id=ctl,fd={ctl_fd}",
            "hostfwd=tcp::{fwd1}-:3389",
            "-object",
            r#"{"qom-type":"rng-random","id":"rng0"}"#,
            "{unknown}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let out = p.expand_argv(&argv);
        assert_eq!(out[1], "hck-7-c1");
        assert_eq!(out[3], "socket,id=ctl,fd=9");
        assert_eq!(out[4], "hostfwd=tcp::40002-:3389");
        assert_eq!(out[6], argv[6]);
        assert_eq!(out[7], "{unknown}");
    }
}
