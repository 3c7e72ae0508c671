use colored::Colorize;

use util::Timer;

/// All interactions with the text UI should go through this struct.
#[derive(Debug, Clone)]
pub struct Ui {
    /// 0 shows only errors; 2 and up shows per-step progress
    verbosity: u8,
    /// keeps track of time for the whole run
    timer: Timer,
}

impl Ui {
    pub fn new(verbosity: u8) -> Self {
        Self {
            verbosity,
            timer: Timer::now(),
        }
    }

    pub fn verbose(&self) -> bool {
        self.verbosity > 2
    }

    fn progress(&self) -> bool {
        self.verbosity > 1
    }

    pub fn start_timer(&mut self) {
        self.timer.reset();
    }

    pub fn print_elapsed(&self, what: &str) {
        if self.verbose() {
            self.timer.print_elapsed(what);
        }
    }

    pub fn verbose_msg(&self, msg: &str) {
        if self.verbose() {
            eprintln!("{}", msg);
        }
    }

    pub fn verbose_progress(&self, msg: &str) {
        if self.verbose() {
            eprint!("{}... ", msg.magenta());
        }
    }

    pub fn done(&self) {
        if self.verbose() {
            eprintln!("{}.", "done".green());
        }
    }

    pub fn run(&self, step: &str) {
        if self.progress() {
            eprintln!("{} {step}", "RUN".green());
        }
    }

    pub fn completed(&self, step: &str, skipped: bool) {
        if !self.progress() {
            return;
        }
        if skipped {
            eprintln!("{} {step}", "SKIPPED".cyan());
        } else {
            eprintln!("{} {step}", "COMPLETED".green());
        }
    }

    pub fn failed(&self, step: &str, msg: &str) {
        if self.verbosity > 0 {
            eprintln!("{} {step}: {msg}", "FAILED".red());
        }
    }

    pub fn pending(&self, step: &str, waiting_on: &str) {
        if self.progress() {
            eprintln!("{} {step} ({waiting_on})", "PENDING".yellow());
        }
    }

    pub fn summary(&self, msg: &str) {
        if self.verbosity > 0 {
            eprintln!("\n{}", msg.magenta());
        }
    }
}
