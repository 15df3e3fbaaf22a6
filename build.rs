use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    // Reproducible builds pin the stamp through SOURCE_DATE_EPOCH.
    let mut date_args = vec!["-u".to_owned()];
    if let Ok(epoch) = env::var("SOURCE_DATE_EPOCH") {
        date_args.push("-d".to_owned());
        date_args.push(format!("@{}", epoch.trim()));
    }
    date_args.push("+%Y-%m-%dT%H:%M:%SZ".to_owned());

    let build_date = run_date(&date_args).unwrap_or_else(|| "unknown".to_owned());

    println!("cargo:rustc-env=JOBRELAY_BUILD_DATE_UTC={build_date}");
}

fn run_date(args: &[String]) -> Option<String> {
    Command::new("date")
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
