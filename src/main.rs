fn main() {
    match sos_runner::run() {
        Ok(outcome) => log::debug!("exiting after {outcome:?}"),
        Err(e) => {
            eprintln!("Error: {e:?}");
            std::process::exit(sos_runner::exit_code(&e));
        }
    }
}
