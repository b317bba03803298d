// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use service_profiler_agent::{
    alert::{AlertBreach, AlertConfiguration, AlertMetricType},
    config::ProfilerConfig,
    handler::{local::LocalProfileHandler, multi::MultiProfileHandler, ProfileHandler},
    profiler::CaptureEngineBuilder,
    scheduler::Scheduler,
    service::ProfilerService,
};
use std::{path::PathBuf, time::Duration};

use clap::Parser;

pub fn set_up_tracing() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    let format = tracing_subscriber::fmt::layer().pretty();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(format)
        .with(filter)
        .init();
}

/// Simple program to test the capture engine
#[derive(Parser, Debug)]
struct Args {
    /// Directory the captured profiles are copied into. Repeat to copy into several
    #[arg(long, required = true)]
    output_dir: Vec<PathBuf>,
    /// How often to fire a manual alert
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1m")]
    every: Duration,
    /// How long each capture runs
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    duration: Duration,
    /// Profile definition selector: `profile`, `default`, `profile_without_env_data`, or a path
    #[arg(long, default_value = "profile")]
    settings: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    set_up_tracing();
    tracing::info!("main started");

    let args = Args::parse();

    let config = ProfilerConfig {
        manual_trigger_settings: args.settings,
        ..Default::default()
    }
    .with_env_overrides();
    let engine = CaptureEngineBuilder::default().with_config(config).build();
    let handlers = args
        .output_dir
        .into_iter()
        .map(|dir| Box::new(LocalProfileHandler::new(dir)) as Box<dyn ProfileHandler>)
        .collect();

    tracing::info!("starting profiler");
    let service = ProfilerService::start(
        engine,
        MultiProfileHandler::new(handlers),
        Scheduler::current(),
    )
    .await?;
    tracing::info!("profiler started");

    let alert_configuration = AlertConfiguration {
        profile_duration: args.duration,
        cooldown: args.every,
    };
    let mut ticker = tokio::time::interval(args.every);
    let mut random_string: String = String::with_capacity(1);
    loop {
        ticker.tick().await;
        service.accept(AlertBreach::new(AlertMetricType::Manual, alert_configuration));

        random_string.push('a');
        tracing::info!("inside loop: busy for a while");
        let busy_until = std::time::Instant::now() + args.duration / 2;
        while std::time::Instant::now() < busy_until {
            random_string = random_string.chars().rev().collect();
        }
        random_string.pop();
    }
}
