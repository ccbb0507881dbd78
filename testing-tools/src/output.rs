use colored::*;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug)]
pub struct TestResult {
    pub scenario: String,
    pub passed: bool,
    pub message: Option<String>,
    pub duration: Duration,
}

pub fn print_record(label: &str, record: &Value) {
    let label_colored = if label.contains("tablet") || label.contains("listener") {
        label.bright_magenta()
    } else {
        label.bright_blue()
    };

    println!(
        "\n[{}] {} received",
        label_colored.bold(),
        record["type"].as_str().unwrap_or("untyped").yellow()
    );

    if let Ok(pretty) = serde_json::to_string_pretty(record) {
        println!("   {}", pretty.dimmed());
    }
}

pub fn print_test_summary(results: &[TestResult]) {
    println!("\n{}", "=== TEST SUMMARY ===".bright_white().bold());

    let passed = results.iter().filter(|r| r.passed).count();
    let failed = results.len() - passed;

    for result in results {
        let status = if result.passed {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };

        println!("[{}] {} ({:?})", status, result.scenario, result.duration);

        if let Some(msg) = &result.message {
            println!("      {}", msg.dimmed());
        }
    }

    let elapsed: Duration = results.iter().map(|r| r.duration).sum();
    println!(
        "\n{}: {} passed, {} failed in {:.2?}",
        "Results".bold(),
        passed.to_string().green(),
        failed.to_string().red(),
        elapsed
    );
}
