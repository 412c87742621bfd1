use runbook::{ui, RunbookError};
use std::process;

#[tokio::main]
async fn main() {
    let code = match runbook::cli::run().await {
        Ok(code) => code,
        Err(e) => {
            ui::print_error(&format!("{:#}", e));
            e.downcast_ref::<RunbookError>()
                .map(RunbookError::exit_code)
                .unwrap_or(2)
        }
    };
    process::exit(code);
}
