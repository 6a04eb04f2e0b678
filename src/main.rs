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

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use ::http_analyzer::{
    config::Config,
    dispatcher::Dispatcher,
    flow_generator::protocol_logs::{http::HttpAnalyzer, L7Analyzer},
    pcap::{replay, PcapReader},
    sender::JsonSender,
    utils::logger::init_logger,
};
use public::counter::{format_counters, RefCountable};

#[derive(Parser)]
#[clap(version, about = "Passive HTTP/1.x transaction analyzer")]
struct Opts {
    /// Specify config file location
    #[clap(short = 'f', long)]
    config_file: Option<String>,

    /// Read packets from a pcap capture
    #[clap(short = 'r', long)]
    read: String,

    /// Write events to a file instead of stdout
    #[clap(short = 'o', long)]
    output: Option<String>,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = match opts.config_file.as_ref() {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    let (_logger_handle, log_level_counter) = init_logger(&config)?;

    let writer: Box<dyn Write + Send> = match opts.output.as_ref() {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };
    let sender = Arc::new(JsonSender::new(writer));

    let analyzer = HttpAnalyzer::new(config.http.clone(), sender.clone());
    analyzer.table().start();
    let mut dispatcher = Dispatcher::new(vec![analyzer.into()]);

    let mut reader = PcapReader::open(&opts.read)?;
    replay(&mut reader, &mut dispatcher)?;
    sender.flush()?;

    for analyzer in dispatcher.analyzers() {
        match analyzer {
            L7Analyzer::HttpAnalyzer(a) => {
                a.table().stop();
                info!("{}", format_counters("http", &a.get_counters()));
            }
        }
    }
    info!(
        "{}",
        format_counters("dispatcher", &dispatcher.counter().get_counters())
    );
    info!("{}", format_counters("sender", &sender.counter().get_counters()));
    info!("{}", format_counters("log", &log_level_counter.get_counters()));

    Ok(())
}
