use iotgw_codec::ConnectAckReason;

/// Gateway level failures. Transport errors stay in [`iotgw_net::MqttError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// A codec hook was left at its default implementation.
    #[error("notimpl")]
    CodecNotImplemented,
    #[error("double CONNECT")]
    DoubleConnect,
    #[error("unexpected {0} packet")]
    UnexpectedPacket(&'static str),
    #[error("QoS 2 is not supported")]
    QoS2Unsupported,
    #[error("server {0} already exists")]
    ServerExists(String),
    #[error("server {0} not found")]
    ServerNotFound(String),
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("the current record is too long, {size} > {max}")]
    FrameTooLong { size: usize, max: usize },
    #[error("session closed")]
    SessionClosed,
    #[error("in-flight window is full")]
    InflightFull,
    #[error("connection refused, {}", .0.reason())]
    Refused(ConnectAckReason),
    #[error("codec panicked, {0}")]
    CodecPanic(String),
}

impl GatewayError {
    /// True when `e` says the codec did not provide the hook.
    #[inline]
    pub fn is_not_implemented(e: &anyhow::Error) -> bool {
        matches!(e.downcast_ref::<GatewayError>(), Some(GatewayError::CodecNotImplemented))
    }
}
