// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! A worker that never touches the queue. It announces itself by writing its
//! pid to `worker.pid` in its sandbox, notes every HUP in `hup.log` and exits
//! when asked to stop, unless the `ignore-stop` option is set.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::thread;
use std::time::Duration;

use qless_workerd::signals;
use qless_workerd::worker::closure_worker::{ClosureFactory, WorkerBody};

pub const KIND: &str = "pidfile";
pub const PID_FILE: &str = "worker.pid";
pub const HUP_LOG: &str = "hup.log";

pub fn factory() -> ClosureFactory {
    ClosureFactory::new("pidfile worker", |spec, _client| {
        let ignore_stop = spec.option("ignore-stop") == Some("true");
        Ok(Box::new(move || -> anyhow::Result<()> {
            // the worker runs inside its sandbox
            fs::write("worker.pid.tmp", std::process::id().to_string())?;
            fs::rename("worker.pid.tmp", PID_FILE)?;

            loop {
                if signals::stop_requested() && !ignore_stop {
                    return Ok(());
                }
                if signals::take_reload_request() {
                    let mut log = OpenOptions::new().create(true).append(true).open(HUP_LOG)?;
                    writeln!(log, "hup")?;
                }
                thread::sleep(Duration::from_millis(20));
            }
        }) as WorkerBody)
    })
}
