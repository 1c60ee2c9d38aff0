use crate::domain::{
    GatewayStats, IdentityResolver, LabelResolution, MeshMessageHandler,
};
use common::domain::{
    sanitize_for_log, DomainResult, MeshMessage, MessageType, NodeInfoPayload, PositionPayload,
    PositionReport, PositionReporter, TelemetryPayload, TraceroutePayload,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What happened to a message that was handled without an internal fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    /// Dispatched and handled; counts towards `messages_processed`
    Processed,
    /// Dropped by policy or because the input was unusable
    Dropped,
}

/// Default cap on position reports being delivered at once
pub const DEFAULT_MAX_IN_FLIGHT_REPORTS: usize = 64;

/// Dispatches decoded bus messages to type-specific handlers.
///
/// Synchronous: identity work is cache-backed, and position reports are
/// spawned onto a [`TaskTracker`] so the next message is never held up by a
/// slow delivery. At most `max_in_flight_reports` deliveries run at once;
/// positions arriving beyond that are dropped and counted as errors.
pub struct MessageRouter {
    resolver: Arc<IdentityResolver>,
    reporter: Arc<dyn PositionReporter>,
    stats: Arc<GatewayStats>,
    report_tasks: TaskTracker,
    report_permits: Arc<Semaphore>,
    max_in_flight_reports: usize,
}

impl MessageRouter {
    pub fn new(
        resolver: Arc<IdentityResolver>,
        reporter: Arc<dyn PositionReporter>,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            resolver,
            reporter,
            stats,
            report_tasks: TaskTracker::new(),
            report_permits: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT_REPORTS)),
            max_in_flight_reports: DEFAULT_MAX_IN_FLIGHT_REPORTS,
        }
    }

    /// Cap concurrent report deliveries; zero is treated as one
    pub fn with_max_in_flight_reports(mut self, max_in_flight_reports: usize) -> Self {
        let max_in_flight_reports = max_in_flight_reports.max(1);
        self.report_permits = Arc::new(Semaphore::new(max_in_flight_reports));
        self.max_in_flight_reports = max_in_flight_reports;
        self
    }

    pub fn stats(&self) -> &Arc<GatewayStats> {
        &self.stats
    }

    /// Route one message and update the counters.
    ///
    /// Handler faults are logged and counted as errors; they never propagate.
    pub fn process(&self, message: MeshMessage) -> MessageDisposition {
        self.stats.record_received();

        match self.dispatch(&message) {
            Ok(MessageDisposition::Processed) => {
                self.stats.record_processed();
                MessageDisposition::Processed
            }
            Ok(MessageDisposition::Dropped) => MessageDisposition::Dropped,
            Err(e) => {
                error!(error = %e, "error processing message");
                self.stats.record_error();
                MessageDisposition::Dropped
            }
        }
    }

    /// Stop accepting report tasks and wait for the in-flight ones
    pub async fn wait_for_in_flight_reports(&self) {
        self.report_tasks.close();
        self.report_tasks.wait().await;
    }

    pub fn in_flight_reports(&self) -> usize {
        self.report_tasks.len()
    }

    fn dispatch(&self, message: &MeshMessage) -> DomainResult<MessageDisposition> {
        let Some(node_num) = message.from else {
            warn!("received message without from field");
            return Ok(MessageDisposition::Dropped);
        };

        match &message.message_type {
            MessageType::Position => self.handle_position(node_num, message),
            MessageType::NodeInfo => self.handle_node_info(node_num, message),
            MessageType::Telemetry => Ok(log_telemetry(node_num, message)),
            MessageType::Traceroute => Ok(log_traceroute(node_num, message)),
            MessageType::Empty => {
                debug!(node_num = node_num, "received message with empty type, skipping");
                Ok(MessageDisposition::Dropped)
            }
            MessageType::Unknown(other) => {
                debug!(
                    node_num = node_num,
                    message_type = %sanitize_for_log(other),
                    "received unsupported message type"
                );
                Ok(MessageDisposition::Dropped)
            }
        }
    }

    fn handle_position(
        &self,
        node_num: u64,
        message: &MeshMessage,
    ) -> DomainResult<MessageDisposition> {
        if message.retained {
            debug!(node_num = node_num, "skipping retained position message");
            return Ok(MessageDisposition::Dropped);
        }

        let position: PositionPayload = match message.payload_as() {
            Ok(position) => position,
            Err(e) => {
                warn!(node_num = node_num, error = %e, "dropping position message");
                return Ok(MessageDisposition::Dropped);
            }
        };

        let resolution = self.resolver.resolve_stable_id(node_num);
        let stable_id = resolution.stable_id;

        let label = match self.resolver.resolve_label(&stable_id) {
            LabelResolution::Resolved(label) => label,
            LabelResolution::Deferred => {
                info!(
                    node_num = node_num,
                    stable_id = %stable_id,
                    "no label for configured node yet, skipping position until nodeinfo arrives"
                );
                return Ok(MessageDisposition::Dropped);
            }
            LabelResolution::Blocked => {
                warn!(
                    node_num = node_num,
                    stable_id = %stable_id,
                    "position from unknown device blocked by policy"
                );
                return Ok(MessageDisposition::Dropped);
            }
        };

        if resolution.provisional {
            self.resolver.persist_stable_id(node_num, &stable_id)?;
        }

        let report = PositionReport {
            label,
            latitude: position.latitude(),
            longitude: position.longitude(),
            group: self.resolver.static_group(&stable_id),
        };
        debug!(
            node_num = node_num,
            stable_id = %stable_id,
            latitude = report.latitude,
            longitude = report.longitude,
            altitude = position.altitude,
            "forwarding position"
        );

        Ok(self.spawn_report(report))
    }

    fn handle_node_info(
        &self,
        node_num: u64,
        message: &MeshMessage,
    ) -> DomainResult<MessageDisposition> {
        let node_info: NodeInfoPayload = match message.payload_as() {
            Ok(node_info) => node_info,
            Err(e) => {
                warn!(node_num = node_num, error = %e, "dropping nodeinfo message");
                return Ok(MessageDisposition::Dropped);
            }
        };

        match self.resolver.record_node_info(node_num, &node_info)? {
            Some(update) => {
                info!(
                    node_num = node_num,
                    stable_id = %update.stable_id,
                    longname = ?node_info.longname.as_deref().map(sanitize_for_log),
                    shortname = ?node_info.shortname.as_deref().map(sanitize_for_log),
                    hardware = ?node_info.hardware,
                    role = ?node_info.role,
                    label_written = update.label_written,
                    "node info"
                );
                Ok(MessageDisposition::Processed)
            }
            None => {
                warn!(node_num = node_num, "nodeinfo message without id, skipping");
                Ok(MessageDisposition::Dropped)
            }
        }
    }

    fn spawn_report(&self, report: PositionReport) -> MessageDisposition {
        let Ok(permit) = Arc::clone(&self.report_permits).try_acquire_owned() else {
            warn!(
                label = %sanitize_for_log(&report.label),
                max_in_flight_reports = self.max_in_flight_reports,
                "report backlog full, dropping position"
            );
            self.stats.record_error();
            return MessageDisposition::Dropped;
        };

        let reporter = Arc::clone(&self.reporter);
        let stats = Arc::clone(&self.stats);
        let span = info_span!("position_report", label = %sanitize_for_log(&report.label));

        self.report_tasks.spawn(
            async move {
                let _permit = permit;
                if reporter.report(&report).await {
                    stats.record_sent();
                } else {
                    stats.record_error();
                }
            }
            .instrument(span),
        );
        MessageDisposition::Processed
    }
}

impl MeshMessageHandler for MessageRouter {
    fn handle_message(&self, message: MeshMessage) {
        self.process(message);
    }
}

fn log_telemetry(node_num: u64, message: &MeshMessage) -> MessageDisposition {
    match message.payload_as::<TelemetryPayload>() {
        Ok(telemetry) => {
            info!(
                node_num = node_num,
                battery_level = telemetry.battery_level,
                voltage = telemetry.voltage,
                uptime_seconds = telemetry.uptime_seconds,
                air_util_tx = telemetry.air_util_tx,
                channel_utilization = telemetry.channel_utilization,
                "telemetry"
            );
            MessageDisposition::Processed
        }
        Err(e) => {
            warn!(node_num = node_num, error = %e, "dropping telemetry message");
            MessageDisposition::Dropped
        }
    }
}

fn log_traceroute(node_num: u64, message: &MeshMessage) -> MessageDisposition {
    match message.payload_as::<TraceroutePayload>() {
        Ok(traceroute) => {
            info!(
                node_num = node_num,
                hops = traceroute.route.len(),
                route = %serde_json::Value::Array(traceroute.route),
                "traceroute"
            );
            MessageDisposition::Processed
        }
        Err(e) => {
            warn!(node_num = node_num, error = %e, "dropping traceroute message");
            MessageDisposition::Dropped
        }
    }
}
