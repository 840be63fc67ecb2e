// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Detection of system sleep.
//!
//! After a suspend/resume cycle, everything the engine believes about
//! the link is suspect: caches are stale, probes may have been won by
//! somebody else, and peers have given up on us. There is no portable
//! notification for "the machine was asleep", but it can be inferred:
//! a thread that sleeps for a fixed interval and wakes up much later
//! than scheduled was, in all likelihood, suspended along with the
//! rest of the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::info;

/// How often the watcher takes a monotonic reading.
const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// How far past the scheduled interval a reading may land before it is
/// taken as evidence of a suspend.
const FUDGE: Duration = Duration::from_secs(5);

/// A background thread that infers system sleep and reports it.
///
/// The callback runs on the watcher thread; keep it to posting an
/// event somewhere.
pub struct SleepWatcher {
    stop: Arc<AtomicBool>,
}

impl SleepWatcher {
    /// Spawns the watcher. `on_wake` fires once per detected
    /// suspend/resume cycle.
    pub fn spawn<F>(on_wake: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        thread::Builder::new()
            .name("mdns-sleep-watch".to_owned())
            .spawn(move || {
                // Sleep in short slices so that stopping the watcher
                // does not take a whole CHECK_INTERVAL; the slices sum
                // to the interval between readings.
                let slice = Duration::from_millis(500);
                let mut scheduled = Instant::now();
                'outer: loop {
                    while Instant::now() < scheduled + CHECK_INTERVAL {
                        if stop_flag.load(Ordering::Relaxed) {
                            break 'outer;
                        }
                        thread::sleep(slice);
                    }
                    let now = Instant::now();
                    if now - scheduled > CHECK_INTERVAL + FUDGE {
                        info!("Detected wake from sleep; notifying the engine.");
                        on_wake();
                    }
                    scheduled = now;
                }
            })
            .expect("failed to spawn the sleep watcher thread");
        Self { stop }
    }

    /// Stops the watcher thread. The thread exits within one sleep
    /// slice; this does not wait for it.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for SleepWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
