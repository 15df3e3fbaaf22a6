use crate::config::RoleConfig;

pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;30m";
    const BANNER: &str = r#"
    _       _                _
   (_) ___ | |__  _ __ ___  | | __ _ _   _
   | |/ _ \| '_ \| '__/ _ \ | |/ _` | | | |
   | | (_) | |_) | | |  __/ | | (_| | |_| |
  _/ |\___/|_.__/|_|  \___| |_|\__,_|\__, |
 |__/                                |___/ "#;
    const APP_DESCRIPTION: &str =
        "Topic/queue job relay: provisions the subscription, publishes job starts and feeds a local worker pool.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("JOBRELAY_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!();
    println!("================================================================");
    println!();
}

/// One-word summary of the enabled roles for the startup log line.
pub fn describe_roles(roles: &RoleConfig) -> &'static str {
    match (roles.publisher, roles.consumer) {
        (true, true) => "publisher+consumer",
        (true, false) => "publisher",
        (false, true) => "consumer",
        (false, false) => "idle",
    }
}
