use std::os::unix::process::CommandExt;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use picomsg_comms::{Comms, CommsConfig, ForkOptions, Forked, Hub, Noise, SendPolicy, Stats};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cmd::{SelftestArgs, SelftestMode};
use crate::exit::{
    comms_error, io_error, send_error, transport_error, CliError, CliResult, DATA_INVALID,
    FAILURE, INTERNAL, SUCCESS, TIMEOUT,
};
use crate::logging::LogLevel;
use crate::output::{print_report, OutputFormat};

/// First message of every run; sent with an extra NUL by `send_str`.
pub(crate) const GREETING: &str = "mary had a little lamb\0";
pub(crate) const GREETING_LEN: usize = GREETING.len() + 1;

#[derive(Debug, Serialize)]
pub struct SelftestReport {
    pub mode: &'static str,
    pub passed: bool,
    pub seed: u64,
    pub messages: usize,
    pub bytes: usize,
    /// Messages the child echoed, when it reports back.
    pub echoed: Option<usize>,
    pub child_exit: Option<i32>,
    pub elapsed_ms: f64,
    pub stats: Stats,
}

struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// `stack * pudge` pseudo-random bytes cut into chunks of `1..=pudge` bytes.
pub(crate) fn workload(seed: u64, stack: usize, pudge: usize) -> Vec<Vec<u8>> {
    let mut rng = XorShift::new(seed);
    let data: Vec<u8> = (0..stack * pudge).map(|_| rng.next() as u8).collect();
    let mut chunks = Vec::new();
    let mut rest = &data[..];
    while !rest.is_empty() {
        let n = (1 + rng.next() as usize % pudge).min(rest.len());
        let (head, tail) = rest.split_at(n);
        chunks.push(head.to_vec());
        rest = tail;
    }
    chunks
}

pub(crate) fn bump(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b.wrapping_add(1)).collect()
}

pub(crate) fn comms_config(name: &str, noise: u8, ring_bits: Option<u32>) -> CommsConfig {
    let config = CommsConfig::default()
        .with_name(name)
        .with_noise(Noise::from_bits(noise));
    match ring_bits {
        Some(bits) => config.with_ring_size_bits(bits),
        None => config,
    }
}

/// Child side: check the greeting, then echo every message with each byte
/// incremented until the parent hangs up.
pub(crate) fn respond(comms: &Comms, timeout: Duration) -> CliResult<usize> {
    let greeting = comms
        .get(timeout)
        .ok_or_else(|| CliError::new(TIMEOUT, "no greeting from parent"))?;
    if greeting.len() != GREETING_LEN {
        return Err(CliError::new(
            DATA_INVALID,
            format!(
                "greeting is {} bytes, expected {GREETING_LEN}",
                greeting.len()
            ),
        ));
    }
    comms.say("Greeted");

    let mut echoed = 0;
    while let Some(msg) = comms.get(timeout) {
        comms
            .send(&bump(&msg), SendPolicy::CanTimeOut)
            .map_err(|err| send_error("echo failed", err))?;
        echoed += 1;
    }
    debug!(echoed, status = ?comms.status(), "responder done");
    Ok(echoed)
}

/// Close and give the workers up to the close grace to flush.
pub(crate) fn finish(comms: &Comms) {
    comms.close("finished");
    let deadline = Instant::now() + comms.config().close_grace;
    while !comms.is_closed() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
}

struct QueryOutcome {
    messages: usize,
    bytes: usize,
    elapsed: Duration,
}

fn query(comms: &Comms, chunks: &[Vec<u8>], timeout: Duration) -> CliResult<QueryOutcome> {
    let start = Instant::now();
    comms
        .send_str(GREETING, SendPolicy::CanTimeOut)
        .map_err(|err| send_error("greeting failed", err))?;
    for chunk in chunks {
        comms
            .send(chunk, SendPolicy::CanTimeOut)
            .map_err(|err| send_error("send failed", err))?;
    }

    let mut bytes = 0;
    for (index, chunk) in chunks.iter().enumerate() {
        let back = comms.get(timeout).ok_or_else(|| {
            CliError::new(
                TIMEOUT,
                format!("no reply to chunk {index} of {}", chunks.len()),
            )
        })?;
        if back.as_bytes() != bump(chunk).as_slice() {
            return Err(CliError::new(
                DATA_INVALID,
                format!(
                    "reply to chunk {index} differs ({} bytes, sent {})",
                    back.len(),
                    chunk.len()
                ),
            ));
        }
        bytes += back.len();
    }
    comms.say("Compared");

    Ok(QueryOutcome {
        messages: chunks.len(),
        bytes,
        elapsed: start.elapsed(),
    })
}

/// How the child end reported back.
enum ChildEnd {
    Echoed(usize),
    Exited(i32),
}

pub fn run(args: SelftestArgs, format: OutputFormat, log_level: LogLevel) -> CliResult<i32> {
    let hub = Hub::global().map_err(|err| comms_error("hub start failed", err))?;
    let chunks = workload(args.seed, args.stack as usize, args.pudge as usize);
    let config = comms_config("Query", args.noise, args.ring_bits);
    let timeout = args.timeout;
    info!(mode = args.mode.as_str(), chunks = chunks.len(), "selftest starting");

    let (comms, child) = match args.mode {
        SelftestMode::Pair => {
            let (parent, child) = hub
                .init_pair(&config)
                .map_err(|err| comms_error("pair failed", err))?;
            child.set_name("Respond");
            let worker = thread::Builder::new()
                .name("picomsg-respond".into())
                .spawn(move || respond(&child, timeout))
                .map_err(|err| io_error("spawn failed", err))?;
            (parent, Child::Thread(worker))
        }
        SelftestMode::Thread => {
            let (parent, worker) = hub
                .init_thread(&config, move |child| {
                    child.set_name("Respond");
                    respond(&child, timeout)
                })
                .map_err(|err| comms_error("thread init failed", err))?;
            (parent, Child::Thread(worker))
        }
        SelftestMode::Fork => match hub
            .init_fork(&config, ForkOptions::default())
            .map_err(|err| comms_error("fork failed", err))?
        {
            Forked::Parent { comms, child } => (comms, Child::Process(child)),
            Forked::Child { comms } => {
                comms.set_name("Respond");
                let code = match respond(&comms, timeout) {
                    Ok(_) => SUCCESS,
                    Err(err) => {
                        eprintln!("error: {err}");
                        err.code
                    }
                };
                finish(&comms);
                // SAFETY: leaves without running the parent's atexit handlers
                // or flushing its inherited stdio buffers.
                unsafe { libc::_exit(code) }
            }
            Forked::ExecReady { .. } => {
                return Err(CliError::new(INTERNAL, "exec hand-off without prepare_exec"))
            }
        },
        SelftestMode::Exec => {
            let mut responder = responder_command(&args, log_level)?;
            match hub
                .init_fork(&config, ForkOptions { prepare_exec: true })
                .map_err(|err| comms_error("fork failed", err))?
            {
                Forked::Parent { comms, child } => (comms, Child::Process(child)),
                Forked::ExecReady { fd } => {
                    debug!(fd, "exec'ing responder");
                    let err = responder.exec();
                    eprintln!("error: exec failed: {err}");
                    // SAFETY: as for the forked child above.
                    unsafe { libc::_exit(127) }
                }
                Forked::Child { .. } => {
                    return Err(CliError::new(INTERNAL, "fork without exec hand-off"))
                }
            }
        }
    };

    let outcome = query(&comms, &chunks, timeout);
    comms.close("selftest done");
    let child_end = child.wait();
    let outcome = outcome?;
    let child_end = child_end?;

    let (echoed, child_exit) = match child_end {
        ChildEnd::Echoed(n) => (Some(n), None),
        ChildEnd::Exited(code) => (None, Some(code)),
    };
    let passed = echoed.map_or(true, |n| n == outcome.messages)
        && child_exit.map_or(true, |code| code == SUCCESS);
    if !passed {
        warn!(?echoed, ?child_exit, "child end did not finish cleanly");
    }

    let report = SelftestReport {
        mode: args.mode.as_str(),
        passed,
        seed: args.seed,
        messages: outcome.messages,
        bytes: outcome.bytes,
        echoed,
        child_exit,
        elapsed_ms: outcome.elapsed.as_secs_f64() * 1000.0,
        stats: comms.stats(),
    };
    print_report(&report, format);

    Ok(if passed { SUCCESS } else { FAILURE })
}

enum Child {
    Thread(thread::JoinHandle<CliResult<usize>>),
    Process(libc::pid_t),
}

impl Child {
    fn wait(self) -> CliResult<ChildEnd> {
        match self {
            Child::Thread(handle) => handle
                .join()
                .map_err(|_| CliError::new(INTERNAL, "responder thread panicked"))?
                .map(ChildEnd::Echoed),
            Child::Process(pid) => picomsg_transport::wait_child(pid)
                .map(ChildEnd::Exited)
                .map_err(|err| transport_error("wait failed", err)),
        }
    }
}

fn responder_command(args: &SelftestArgs, log_level: LogLevel) -> CliResult<process::Command> {
    let exe = std::env::current_exe().map_err(|err| io_error("current_exe failed", err))?;
    let mut command = process::Command::new(exe);
    command
        .arg("--log-level")
        .arg(log_level.as_arg())
        .arg("respond")
        .arg("--timeout")
        .arg(format!("{}ms", args.timeout.as_millis()))
        .arg("--noise")
        .arg(args.noise.to_string());
    if let Some(bits) = args.ring_bits {
        command.arg("--ring-bits").arg(bits.to_string());
    }
    Ok(command)
}
