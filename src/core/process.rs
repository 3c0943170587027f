use vidfetch_core::fs_paths;

fn enhanced_path() -> String {
    let bin_dir = fs_paths::managed_bin_dir();
    let sep = if cfg!(windows) { ";" } else { ":" };
    let current = std::env::var("PATH").unwrap_or_default();
    format!("{}{}{}", current, sep, bin_dir.display())
}

/// Builds a command for an external tool. The managed bin directory is
/// searched after nothing else on `PATH` matched, and the child is killed
/// when its handle is dropped.
pub fn command<S: AsRef<std::ffi::OsStr>>(program: S) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    #[cfg(target_os = "windows")]
    cmd.creation_flags(0x08000000);
    cmd.env("PATH", enhanced_path());
    cmd.env("PYTHONIOENCODING", "utf-8");
    cmd.env("PYTHONUTF8", "1");
    cmd.kill_on_drop(true);
    cmd
}
