use std::collections::HashMap;
use std::net::SocketAddr;

use log::{error, info, warn};
use tokio::task::JoinSet;

use crate::configuration::config::Config;
use crate::data_capture::pipeline::{CapturePipeline, StopHandle};
use crate::data_capture::types::CaptureSummary;
use crate::error_handling::types::*;
use crate::network::gateway_discovery::{discover_gateways, expand_targets};

/// Outcome of one target's pipeline.
#[derive(Debug)]
pub struct CaptureReport {
    pub target: SocketAddr,
    pub outcome: Result<CaptureSummary, CaptureError>,
}

impl CaptureReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Starts one capture pipeline per target and collects what each one did.
///
/// Pipelines are independent: each gets its own task, channel, buffer and
/// file, and a failure in one is only ever reported, never propagated to
/// the others.
pub struct Controller {
    pub config: Config,
}

impl Controller {
    pub fn new(config: Config) -> Self {
        info!("Controller created");
        Self { config }
    }

    /// Configured targets plus, when enabled, discovered gateways on the
    /// discovery ports. Duplicates are dropped.
    pub fn resolve_targets(&self) -> Result<Vec<SocketAddr>, ControllerError> {
        let mut targets = self.config.target_addrs();

        if self.config.discover_gateways {
            match discover_gateways() {
                Ok(gateways) => {
                    for addr in expand_targets(&gateways, &self.config.discovery_ports) {
                        if !targets.contains(&addr) {
                            targets.push(addr);
                        }
                    }
                }
                Err(e) => warn!("Gateway discovery failed, using configured targets only: {}", e),
            }
        }

        if targets.is_empty() {
            error!("No capture targets configured or discovered");
            return Err(ConfigError::TargetsEmpty(
                "no targets configured and none discovered".to_string(),
            )
            .into());
        }
        Ok(targets)
    }

    /// Resolves targets, captures from all of them until each finishes or
    /// Ctrl-C stops them, and reports per-target outcomes.
    ///
    /// Errors
    /// - [`ControllerError::ConfigurationError`] wrapping
    ///   [`ConfigError::TargetsEmpty`] when there is nothing to capture from.
    /// - [`ControllerError::AllCapturesFailed`] when not a single pipeline succeeded.
    pub async fn run(&self) -> Result<Vec<CaptureReport>, ControllerError> {
        let targets = self.resolve_targets()?;
        let (pipelines, stops) = self.build_pipelines(&targets);

        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping {} capture(s)", stops.len());
                for stop in &stops {
                    stop.stop();
                }
            }
        });

        let reports = Self::supervise(pipelines).await;
        interrupt.abort();

        if reports.iter().all(|r| !r.is_success()) {
            return Err(ControllerError::AllCapturesFailed(reports.len()));
        }
        Ok(reports)
    }

    /// Runs one pipeline per target to completion.
    pub async fn run_targets(&self, targets: &[SocketAddr]) -> Vec<CaptureReport> {
        let (pipelines, _stops) = self.build_pipelines(targets);
        Self::supervise(pipelines).await
    }

    fn build_pipelines(&self, targets: &[SocketAddr]) -> (Vec<CapturePipeline>, Vec<StopHandle>) {
        let settings = self.config.capture_settings();
        let pipelines: Vec<CapturePipeline> = targets
            .iter()
            .map(|&target| CapturePipeline::new(target, settings.clone()))
            .collect();
        let stops = pipelines.iter().map(CapturePipeline::stop_handle).collect();
        (pipelines, stops)
    }

    /// Reports come back in the order the pipelines finish.
    async fn supervise(pipelines: Vec<CapturePipeline>) -> Vec<CaptureReport> {
        info!("Starting {} capture pipeline(s)", pipelines.len());

        let mut set = JoinSet::new();
        let mut targets = HashMap::with_capacity(pipelines.len());
        for mut pipeline in pipelines {
            let target = pipeline.target();
            let handle = set.spawn(async move { pipeline.run().await });
            targets.insert(handle.id(), target);
        }

        let mut reports = Vec::with_capacity(targets.len());
        while let Some(joined) = set.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(e) => (e.id(), Err(CaptureError::StageFailed(e.to_string()))),
            };
            let Some(target) = targets.remove(&id) else {
                warn!("Capture task {} finished with no known target", id);
                continue;
            };
            match &outcome {
                Ok(summary) => info!(
                    "{}: {} frame(s), {} byte(s) received -> {} ({})",
                    target,
                    summary.frames_written,
                    summary.bytes_received,
                    summary.output_path.display(),
                    summary.stop_reason
                ),
                Err(e) => error!("{}: capture failed: {}", target, e),
            }
            reports.push(CaptureReport { target, outcome });
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::TargetConfig;
    use crate::data_capture::reassembler::encode_frame;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn config_in(dir: &std::path::Path) -> Config {
        Config {
            output_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn no_targets_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::new(config_in(dir.path()));
        let err = controller.resolve_targets().unwrap_err();
        assert!(matches!(
            err,
            ControllerError::ConfigurationError(ConfigError::TargetsEmpty(_))
        ));
        assert!(err.to_string().starts_with("Configuration error: Targets"));
    }

    #[test]
    fn configured_targets_are_resolved_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            targets: vec![TargetConfig {
                address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                ports: vec![9801, 9800, 9801],
            }],
            ..config_in(dir.path())
        };
        let targets = Controller::new(config).resolve_targets().unwrap();
        assert_eq!(
            targets,
            vec![
                "10.0.0.1:9801".parse::<SocketAddr>().unwrap(),
                "10.0.0.1:9800".parse().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn one_failing_target_does_not_affect_another() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let good = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&encode_frame(b"alive").unwrap()).await.unwrap();
            sock.shutdown().await.unwrap();
        });

        let closed = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let bad = closed.local_addr().unwrap();
        drop(closed);

        let controller = Controller::new(config_in(dir.path()));
        let reports = controller.run_targets(&[bad, good]).await;
        server.await.unwrap();

        assert_eq!(reports.len(), 2);
        let report_for = |addr| reports.iter().find(|r| r.target == addr).unwrap();
        assert!(matches!(
            report_for(bad).outcome,
            Err(CaptureError::ConnectFailed(_, _))
        ));
        let summary = report_for(good).outcome.as_ref().unwrap();
        assert_eq!(summary.frames_written, 1);
        assert!(summary.output_path.starts_with(dir.path()));
    }

    #[tokio::test]
    async fn reports_arrive_as_pipelines_finish() {
        let dir = tempfile::tempdir().unwrap();

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let slow = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            sock.shutdown().await.unwrap();
        });

        let closed = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let fast = closed.local_addr().unwrap();
        drop(closed);

        let controller = Controller::new(config_in(dir.path()));
        let reports = controller.run_targets(&[slow, fast]).await;
        server.await.unwrap();

        let order: Vec<SocketAddr> = reports.iter().map(|r| r.target).collect();
        assert_eq!(order, vec![fast, slow]);
        assert!(!reports[0].is_success());
        assert!(reports[1].is_success());
    }
}
