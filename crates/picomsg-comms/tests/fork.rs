//! Parent/child over a real `fork`.
//!
//! Child sides never return into the test harness: they leave through
//! `_exit` with a code the parent checks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::Duration;

use picomsg_comms::{Comms, CommsConfig, ForkOptions, Forked, Hub, HubConfig, Noise, SendPolicy};
use picomsg_transport::wait_child;

// One fork at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn config() -> CommsConfig {
    CommsConfig::default().with_noise(Noise::SILENT)
}

fn echo_until_closed(comms: &Comms) -> i32 {
    let mut echoed = 0;
    while let Some(msg) = comms.get(Duration::from_secs(10)) {
        let bumped: Vec<u8> = msg.iter().map(|b| b.wrapping_add(1)).collect();
        if comms.send(&bumped, SendPolicy::CanTimeOut).is_err() {
            return 101;
        }
        echoed += 1;
    }
    echoed
}

/// Run `body` as the child's whole life.
fn child_main(body: impl FnOnce() -> i32) -> ! {
    let code = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(100);
    // SAFETY: leaving the forked child without running the harness's teardown.
    unsafe { libc::_exit(code) }
}

fn query(comms: &Comms, rounds: u8) {
    for i in 0..rounds {
        comms.send(&[i; 300], SendPolicy::CanTimeOut).unwrap();
        let back = comms.get(Duration::from_secs(5)).expect("echo");
        assert_eq!(back.as_bytes(), &[i.wrapping_add(1); 300]);
    }
}

#[test]
fn forked_child_echoes() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let hub = Hub::new(HubConfig::default()).unwrap();

    match hub.init_fork(&config(), ForkOptions::default()).unwrap() {
        Forked::Parent { comms, child } => {
            comms.send_str("mary had a little lamb\0", SendPolicy::CanTimeOut).unwrap();
            query(&comms, 12);
            comms.close("done");
            // greeting + 12 echoes
            assert_eq!(wait_child(child).unwrap(), 13);
        }
        Forked::Child { comms } => child_main(|| {
            let Some(mary) = comms.get(Duration::from_secs(5)) else {
                return 102;
            };
            if mary.len() != 24 {
                return 103;
            }
            echo_until_closed(&comms) + 1
        }),
        Forked::ExecReady { .. } => unreachable!("exec not requested"),
    }
}

#[test]
fn exec_hand_off_through_environment() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let hub = Hub::new(HubConfig::default()).unwrap();
    let options = ForkOptions { prepare_exec: true };

    match hub.init_fork(&config(), options).unwrap() {
        Forked::Parent { comms, child } => {
            query(&comms, 5);
            comms.close("done");
            assert_eq!(wait_child(child).unwrap(), 5);
        }
        // Stands in for the freshly exec'd image.
        Forked::ExecReady { .. } => child_main(|| {
            let Ok(hub) = Hub::new(HubConfig::default()) else {
                return 104;
            };
            match hub.inherit(&config()) {
                Ok(Some(comms)) => echo_until_closed(&comms),
                _ => 105,
            }
        }),
        Forked::Child { .. } => unreachable!("exec requested"),
    }
}
