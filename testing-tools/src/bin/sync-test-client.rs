use clap::Parser;
use colored::*;
use std::net::SocketAddr;

use testing_tools::output::print_test_summary;
use testing_tools::scenarios;

#[derive(Parser)]
#[command(name = "sync-test-client")]
#[command(about = "Reading sync fabric integration testing tool")]
struct Cli {
    /// Address of the reliable progress channel
    #[arg(long, default_value = "127.0.0.1:9090")]
    tcp_addr: SocketAddr,

    /// Address of the best-effort notification channel
    #[arg(long, default_value = "127.0.0.1:9091")]
    udp_addr: SocketAddr,

    /// Test scenario to run
    #[arg(long, value_enum)]
    scenario: ScenarioChoice,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, PartialEq, Eq)]
enum ScenarioChoice {
    /// Two TCP sessions for one user; progress from one reaches the other
    MultiDevice,
    /// An empty user id is refused
    AuthRejected,
    /// UDP registration followed by a release fan-out
    Release,
    /// Scoped UDP unregister only removes overlapping registrations
    ScopedUnregister,
    /// Run every scenario
    All,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }

    println!("{}", "=== TEST PHASE ===".bright_white().bold());
    println!(
        "{} Progress channel tcp://{}, notifications udp://{}",
        "→".blue(),
        cli.tcp_addr,
        cli.udp_addr
    );

    let runs = |choice: ScenarioChoice| cli.scenario == choice || cli.scenario == ScenarioChoice::All;
    let mut results = Vec::new();

    if runs(ScenarioChoice::MultiDevice) {
        results.push(scenarios::test_multi_device(cli.tcp_addr).await);
    }
    if runs(ScenarioChoice::AuthRejected) {
        results.push(scenarios::test_auth_rejected(cli.tcp_addr).await);
    }
    if runs(ScenarioChoice::Release) {
        results.push(scenarios::test_release(cli.udp_addr).await);
    }
    if runs(ScenarioChoice::ScopedUnregister) {
        results.push(scenarios::test_scoped_unregister(cli.udp_addr).await);
    }

    println!("\n{}", "=== RESULTS ===".bright_white().bold());
    print_test_summary(&results);

    let all_passed = results.iter().all(|r| r.passed);

    if all_passed {
        println!("\n{}", "All tests passed! ✓".bright_green().bold());
    } else {
        println!("\n{}", "Some tests failed! ✗".bright_red().bold());
    }

    std::process::exit(if all_passed { 0 } else { 1 });
}
