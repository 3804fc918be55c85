//! Resource-utilisation sampling for the duration of the task.

use sysinfo::System;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::api;

const SAMPLE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

pub struct MetricsResult {
    pub resource_utilization: Option<api::ResourceUtilization>,
    pub errors: Vec<String>,
}

/// Sample CPU and memory until the token is cancelled, then deliver the
/// charts over the returned channel.
pub fn run(token: CancellationToken) -> oneshot::Receiver<MetricsResult> {
    let (sender, receiver) = oneshot::channel();

    tokio::spawn(async move {
        let mut system = System::new();
        let mut cpu_chart = Vec::new();
        let mut memory_chart = Vec::new();
        let started = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(SAMPLE_INTERVAL) => {
                    system.refresh_cpu_usage();
                    system.refresh_memory();

                    let seconds_from_start = started.elapsed().as_secs() as u32;
                    cpu_chart.push(api::ChartPoint {
                        seconds_from_start,
                        value: f64::from(system.global_cpu_usage()),
                    });
                    memory_chart.push(api::ChartPoint {
                        seconds_from_start,
                        value: system.used_memory() as f64,
                    });
                }
            }
        }

        let _ = sender.send(MetricsResult {
            resource_utilization: Some(api::ResourceUtilization {
                cpu_chart,
                memory_chart,
            }),
            errors: Vec::new(),
        });
    });

    receiver
}
