//! Stand-in VM process for exercising the supervisor without a hypervisor.
//!
//! Speaks the control protocol on the inherited descriptor given by
//! `--ctl-fd`, and can be told to ignore stop requests or to exit on its own.

use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde_json::{json, Value};

#[derive(Default)]
struct Opts {
    ctl_fd: Option<i32>,
    ignore_powerdown: bool,
    ignore_quit: bool,
    exit_after_ms: Option<u64>,
    exit_code: i32,
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Opts, String> {
    let mut opts = Opts::default();
    let mut args = args;
    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().ok_or_else(|| format!("{name} needs a value"));
        match arg.as_str() {
            "--ctl-fd" => {
                let raw = value("--ctl-fd")?;
                opts.ctl_fd = Some(raw.parse().map_err(|_| format!("bad --ctl-fd {raw:?}"))?);
            }
            "--ignore-powerdown" => opts.ignore_powerdown = true,
            "--ignore-quit" => opts.ignore_quit = true,
            "--exit-after-ms" => {
                let raw = value("--exit-after-ms")?;
                opts.exit_after_ms =
                    Some(raw.parse().map_err(|_| format!("bad --exit-after-ms {raw:?}"))?);
            }
            "--exit-code" => {
                let raw = value("--exit-code")?;
                opts.exit_code = raw.parse().map_err(|_| format!("bad --exit-code {raw:?}"))?;
            }
            other => return Err(format!("unknown argument {other:?}")),
        }
    }
    Ok(opts)
}

fn send(out: &mut UnixStream, msg: &Value) -> io::Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    out.write_all(&line)?;
    out.flush()
}

fn reply(out: &mut UnixStream, id: Option<&Value>, ret: Value) -> io::Result<()> {
    let mut msg = json!({ "return": ret });
    if let Some(id) = id {
        msg["id"] = id.clone();
    }
    send(out, &msg)
}

fn serve(opts: &Opts, fd: i32) -> io::Result<i32> {
    // SAFETY: the descriptor was handed to us by the parent for exclusive use.
    let stream = unsafe { UnixStream::from_raw_fd(fd) };
    let mut out = stream.try_clone()?;
    let reader = BufReader::new(stream);

    send(
        &mut out,
        &json!({ "QMP": { "version": { "package": "hcklab-fake-vm" }, "capabilities": [] } }),
    )?;

    for line in reader.lines() {
        let line = line?;
        let Ok(req) = serde_json::from_str::<Value>(&line) else {
            send(&mut out, &json!({ "error": { "class": "GenericError", "desc": "invalid JSON" } }))?;
            continue;
        };
        let id = req.get("id");
        match req.get("execute").and_then(Value::as_str).unwrap_or_default() {
            "qmp_capabilities" => reply(&mut out, id, json!({}))?,
            "query-status" => reply(&mut out, id, json!({ "status": "running", "running": true }))?,
            "system_powerdown" => {
                reply(&mut out, id, json!({}))?;
                if !opts.ignore_powerdown {
                    send(&mut out, &json!({ "event": "POWERDOWN" }))?;
                    return Ok(0);
                }
            }
            "quit" => {
                reply(&mut out, id, json!({}))?;
                if !opts.ignore_quit {
                    return Ok(0);
                }
            }
            other => {
                let mut msg = json!({
                    "error": { "class": "CommandNotFound", "desc": format!("The command {other} has not been found") }
                });
                if let Some(id) = id {
                    msg["id"] = id.clone();
                }
                send(&mut out, &msg)?;
            }
        }
    }

    // Parent closed its end; keep running until killed.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

fn main() {
    let opts = match parse_args(std::env::args().skip(1)) {
        Ok(o) => o,
        Err(msg) => {
            eprintln!("hcklab-fake-vm: {msg}");
            std::process::exit(2);
        }
    };

    if let Some(ms) = opts.exit_after_ms {
        let code = opts.exit_code;
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(ms));
            std::process::exit(code);
        });
    }

    let code = match opts.ctl_fd {
        Some(fd) => match serve(&opts, fd) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("hcklab-fake-vm: io error: {e}");
                1
            }
        },
        None => loop {
            std::thread::sleep(Duration::from_secs(3600));
        },
    };
    std::process::exit(code);
}
