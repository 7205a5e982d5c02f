use std::time::{Duration, Instant};

/// Operations slower than this are logged as warnings when their timer drops.
pub const SLOW_OPERATION: Duration = Duration::from_secs(1);

/// Install the process logger. `RUST_LOG` wins over `debug` when set.
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_logging(debug: bool) {
    let filter = if debug { "debug" } else { "info" };

    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{}] {} [{}] {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.module_path().unwrap_or("unknown"),
                record.args()
            )
        })
        .try_init();

    if result.is_err() {
        log::debug!("Logger already initialised");
    }
}

/// Measures one operation.
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }

    pub fn debug(&self, chat_id: &str) {
        log::debug!("[{}] {} completed in {}ms", chat_id, self.name, self.elapsed_ms());
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        if elapsed > SLOW_OPERATION {
            log::warn!("{} took {}ms (slow!)", self.name, elapsed.as_millis());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        init_logging(true);
        init_logging(false);
    }

    #[test]
    fn timer_measures_elapsed_time() {
        let timer = Timer::new("sleep");
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed_ms() >= 5);
        timer.debug("chat");
    }
}
