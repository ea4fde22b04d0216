// Internal logging facade: `debug!`, `info!`, `warn!`, `error!` resolve to
// `tracing`, `log`, or a no-op depending on the enabled features.

#[allow(unused_imports)]
pub(crate) use crate::observability::{
    log_debug as debug, log_error as error, log_info as info, log_warn as warn,
};
