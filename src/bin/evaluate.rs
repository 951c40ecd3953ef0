//! 离线评测 CLI
//!
//! Usage:
//!   evaluate --input <DATASET_DIR> --output <METRICS_JSON>

use jianwei_core::{
    config::Config,
    metrics::{compute_metrics, evaluate_folder, EvalReport},
    ScoringEngine,
};
use std::path::PathBuf;
use std::process::ExitCode;

fn print_usage() {
    eprintln!(
        r#"evaluate - 在带标注的数据集上评测检测器

USAGE:
    evaluate --input <DIR> --output <FILE>

OPTIONS:
    --input <DIR>     数据集根目录，需包含 real/ 与 synthetic/ 子目录
    --output <FILE>   指标 JSON 的输出路径（父目录会自动创建）

模型与打分头配置沿用服务的环境变量（MODEL_NAME、HEAD_PATH 等）。"#
    );
}

struct Args {
    input: PathBuf,
    output: PathBuf,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut input = None;
    let mut output = None;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--input" => input = iter.next().map(PathBuf::from),
            "--output" => output = iter.next().map(PathBuf::from),
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }

    Ok(Args {
        input: input.ok_or("--input is required")?,
        output: output.ok_or("--output is required")?,
    })
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let engine = ScoringEngine::initialize(&config.model, &config.head_path)?;

    let (scores, labels) = evaluate_folder(&engine, &args.input)?;
    let report = EvalReport {
        metrics: compute_metrics(&scores, &labels),
        num_samples: scores.len(),
    };

    if let Some(parent) = args.output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&args.output, serde_json::to_string_pretty(&report)?)?;

    println!("{}", serde_json::to_string_pretty(&report.metrics)?);
    Ok(())
}

fn main() -> ExitCode {
    jianwei_core::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            print_usage();
            return ExitCode::from(1);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("evaluate failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}
