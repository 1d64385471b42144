use crate::frame::BmpMsgType;

/// Per-session receive/send counters, owned by the framer task and logged
/// when the session ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerStatistics {
    pub rx_bmp_messages: u64,
    pub rx_route_monitoring: u64,
    pub rx_stats_report: u64,
    pub rx_peer_down: u64,
    pub rx_peer_up: u64,
    pub rx_initiation: u64,
    pub rx_termination: u64,
    pub rx_route_mirroring: u64,
    pub rx_unknown_type: u64,
    pub rx_invalid: u64,
    pub tx_envelopes: u64,
    pub tx_dropped: u64,
}

impl WorkerStatistics {
    pub fn observe_rx(&mut self, kind: Option<BmpMsgType>) {
        self.rx_bmp_messages += 1;
        match kind {
            Some(BmpMsgType::RouteMonitoring) => self.rx_route_monitoring += 1,
            Some(BmpMsgType::StatisticsReport) => self.rx_stats_report += 1,
            Some(BmpMsgType::PeerDownNotification) => self.rx_peer_down += 1,
            Some(BmpMsgType::PeerUpNotification) => self.rx_peer_up += 1,
            Some(BmpMsgType::InitiationMessage) => self.rx_initiation += 1,
            Some(BmpMsgType::TerminationMessage) => self.rx_termination += 1,
            Some(BmpMsgType::RouteMirroringMessage) => self.rx_route_mirroring += 1,
            None => self.rx_unknown_type += 1,
        }
    }
}
