/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::io;
use std::path::Path;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use flexi_logger::{
    colored_opt_format, writers::LogWriter, Age, Cleanup, Criterion, DeferredNow, Duplicate,
    FileSpec, FlexiLoggerError, Level, Logger, LoggerHandle, Naming, Record,
};

use public::counter::{Counter as CounterItem, CounterType, CounterValue, RefCountable};

use crate::config::Config;

#[derive(Default)]
struct Counter {
    error: AtomicU64,
    warning: AtomicU64,
}

// A writer calculating log count by level without actually writing log
pub struct LogLevelWriter(Arc<Counter>);

impl LogLevelWriter {
    pub fn new() -> (Self, LogLevelCounter) {
        let c = Arc::new(Counter::default());
        (Self(c.clone()), LogLevelCounter(c))
    }
}

impl LogWriter for LogLevelWriter {
    fn write(&self, _: &mut DeferredNow, record: &Record<'_>) -> io::Result<()> {
        match record.level() {
            Level::Error => &self.0.error,
            Level::Warn => &self.0.warning,
            _ => return Ok(()),
        }
        .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

pub struct LogLevelCounter(Arc<Counter>);

impl RefCountable for LogLevelCounter {
    fn get_counters(&self) -> Vec<CounterItem> {
        vec![
            (
                "error",
                CounterType::Counted,
                CounterValue::Unsigned(self.0.error.load(Ordering::Relaxed)),
            ),
            (
                "warning",
                CounterType::Counted,
                CounterValue::Unsigned(self.0.warning.load(Ordering::Relaxed)),
            ),
        ]
    }
}

/// Starts logging to stderr, and to a daily rotated file when `log-file` is
/// set. `RUST_LOG` overrides the configured level.
pub fn init_logger(config: &Config) -> Result<(LoggerHandle, LogLevelCounter), FlexiLoggerError> {
    let (log_level_writer, log_level_counter) = LogLevelWriter::new();
    let logger = Logger::try_with_env_or_str(&config.log_level)?.format(colored_opt_format);

    let write_to_file = !config.log_file.is_empty()
        && match Path::new(&config.log_file).parent() {
            Some(base_path) if base_path.exists() => base_path
                .metadata()
                .ok()
                .map(|meta| !meta.permissions().readonly())
                .unwrap_or(false),
            Some(base_path) => std::fs::create_dir_all(base_path).is_ok(),
            None => false,
        };
    let logger = if write_to_file {
        logger
            .log_to_file_and_writer(
                FileSpec::try_from(&config.log_file)?,
                Box::new(log_level_writer),
            )
            .rotate(
                Criterion::Age(Age::Day),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(config.log_retention),
            )
            .append()
    } else {
        if !config.log_file.is_empty() {
            eprintln!(
                "Log file path '{}' access denied, logs will not be written to file",
                &config.log_file
            );
        }
        logger.log_to_writer(Box::new(log_level_writer))
    };

    let handle = logger.duplicate_to_stderr(Duplicate::All).start()?;
    Ok((handle, log_level_counter))
}
