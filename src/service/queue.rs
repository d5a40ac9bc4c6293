// Queue-depth probing.
//
// Some deployments pair each service with a host message queue named after
// the service's logical name (e.g. MSMQ on Windows) and restart the service
// when the queue backs up. The facility is OS-specific and optional, so the
// probe answers `None` when no depth can be observed; the monitor treats
// that as "no queue-based breach possible", never as an error.

/// Supplies the observed queue depth for a logical service name.
pub trait QueueProbe: Send + Sync {
    /// Current depth of the queue matching `logical_name`, or `None` when
    /// the queue (or the whole facility) is unavailable.
    fn queue_depth(&self, logical_name: &str) -> Option<u64>;
}

/// The permanent answer on platforms without a host queue facility. The
/// `queue_threshold` policy field is kept either way so the configuration
/// schema stays identical across platforms.
pub struct UnavailableQueueProbe;

impl QueueProbe for UnavailableQueueProbe {
    fn queue_depth(&self, _logical_name: &str) -> Option<u64> {
        None
    }
}

/// The queue probe for the current platform.
pub fn platform_probe() -> Box<dyn QueueProbe> {
    Box::new(UnavailableQueueProbe)
}
