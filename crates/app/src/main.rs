use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so they do not interleave with the conversation on stdout.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    match granny::app::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("{error}");
            ExitCode::FAILURE
        }
    }
}
