//! Consumer callback boundary

use crate::types::EdgeEvent;

/// Receives edge events resolved by the dispatch bridge.
///
/// Implementations must not block: in inline mode they run on the daemon's
/// notification thread. Returned errors and panics are caught by the bridge
/// and reported out of band.
///
/// Any `Fn(&EdgeEvent) -> anyhow::Result<()>` closure is a callback:
///
/// ```
/// use gpio_edge_bridge::{EdgeCallback, EdgeEvent};
///
/// fn takes_callback(_cb: impl EdgeCallback) {}
///
/// takes_callback(|event: &EdgeEvent| -> anyhow::Result<()> {
///     println!("GPIO {} -> {}", event.pin, event.level);
///     Ok(())
/// });
/// ```
pub trait EdgeCallback: Send + Sync + 'static {
    /// Called once per resolved edge event
    fn on_edge(&self, event: &EdgeEvent) -> anyhow::Result<()>;
}

impl<F> EdgeCallback for F
where
    F: Fn(&EdgeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_edge(&self, event: &EdgeEvent) -> anyhow::Result<()> {
        self(event)
    }
}
