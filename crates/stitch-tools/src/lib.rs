mod shell;

pub use shell::{PlatformShellRunner, ShellRunResult, ShellRunner};
