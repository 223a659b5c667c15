mod build;
mod pack;
mod reconcile;

pub use build::cmd_build;
pub use pack::cmd_pack;
pub use reconcile::{ReconcileArgs, cmd_reconcile};

use fluxnix_lib::cancel::CancelToken;

use crate::output::print_warning;

/// Exit status for a process stopped by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Cancel `cancel` on the first Ctrl-C and exit on the second. Must be
/// called inside the runtime.
///
/// Listening replaces the default SIGINT action for the rest of the
/// process, so the second Ctrl-C has to be handled here too.
fn cancel_on_ctrl_c(cancel: &CancelToken) {
  let cancel = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_err() {
      return;
    }
    print_warning("Interrupted, cancelling (press Ctrl-C again to exit)");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
      std::process::exit(INTERRUPTED_EXIT_CODE);
    }
  });
}
