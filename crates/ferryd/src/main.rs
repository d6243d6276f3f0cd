use std::process::ExitCode;

fn main() -> ExitCode {
    match ferryd::run_daemon() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("ferryd: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}
