// CLI commands for running the judge locally
use anyhow::{bail, Context, Result};
use arbiter_common::{Config, Language, Submission, SubmissionRequest, SubmissionStatus};
use arbiter_judge::{
    provider_for, FsProblemRepository, JudgeService, LanguageRegistry, MemoryArtifactStore,
    ProblemRepository, Scheduler,
};
use std::path::Path;
use std::sync::Arc;

/// Picks the language from the flag, falling back to the file extension
fn pick_language(registry: &LanguageRegistry, name: Option<&str>, file: &Path) -> Result<Language> {
    if let Some(name) = name {
        return Ok(registry.resolve(name)?);
    }
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    registry
        .profiles()
        .find(|profile| {
            profile
                .extensions
                .iter()
                .any(|ext| file_name.ends_with(ext.as_str()))
        })
        .map(|profile| profile.language)
        .with_context(|| {
            format!(
                "cannot guess the language of {}, pass --language",
                file.display()
            )
        })
}

/// Judge one file through the same scheduler the server uses
pub async fn run(
    config: &Config,
    file: &Path,
    problem_id: &str,
    language: Option<&str>,
    json: bool,
) -> Result<()> {
    let code = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let registry = LanguageRegistry::from_config(config);
    let language = pick_language(&registry, language, file)?;
    let filename = file.file_name().map(|n| n.to_string_lossy().into_owned());
    registry
        .get(language)?
        .validate_source(filename.as_deref(), &code)?;

    let provider = provider_for(config.backend).context("Failed to set up isolation provider")?;
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let code_ref = artifacts.put(code);
    let service = Arc::new(JudgeService::from_config(config, provider, artifacts));
    let scheduler = Scheduler::new(service, 1);

    if !json {
        println!("⚖️  Judging {} ({}) against problem {}", file.display(), language, problem_id);
    }

    let id = scheduler.add_submission(SubmissionRequest {
        language,
        problem_id: problem_id.to_string(),
        code_ref,
    })?;
    let submission = scheduler.wait_for(id).await;
    scheduler.shutdown().await;

    let Some(submission) = submission else {
        bail!("submission {} disappeared before finishing", id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&submission)?);
    } else {
        print_report(&submission);
    }

    if submission.status == SubmissionStatus::Error {
        bail!(
            "judging failed: {}",
            submission.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_report(submission: &Submission) {
    println!();
    println!("{:<16} {:<24} {:>10} {:>10}", "TEST", "VERDICT", "TIME", "MEMORY");
    println!("{}", "─".repeat(63));
    for result in &submission.results {
        let mark = if result.verdict.is_accepted() { "✓" } else { "✗" };
        println!(
            "{:<16} {} {:<22} {:>9.3}s {:>8}MB",
            result.test,
            mark,
            result.verdict.to_string(),
            result.time_used_secs,
            result.memory_used_mb
        );
    }

    if let Some(summary) = &submission.summary {
        println!();
        println!(
            "Passed {}/{} ({} failed)",
            summary.passed, summary.total, summary.failed
        );
    }
}

/// List problems that load cleanly
pub async fn list_problems(config: &Config) -> Result<()> {
    let repository = FsProblemRepository::new(config.problems_dir.clone());
    let problems = repository
        .list_problems()
        .await
        .with_context(|| format!("Failed to list {}", config.problems_dir.display()))?;

    if problems.is_empty() {
        println!("No problems found in {}", config.problems_dir.display());
        return Ok(());
    }

    println!("📚 Problems in {}:", config.problems_dir.display());
    println!();
    for problem in problems {
        println!(
            "  {:<12} {:<32} {:>6.2}s {:>6}MB {:>4} tests",
            problem.id,
            problem.title.as_deref().unwrap_or("-"),
            problem.time_limit_secs,
            problem.memory_limit_mb,
            problem.tests
        );
    }
    Ok(())
}

/// List supported languages
pub fn list_languages(config: &Config) {
    let registry = LanguageRegistry::from_config(config);

    println!("📋 Supported languages:");
    println!();
    for profile in registry.profiles() {
        let layout = profile.layout("/sandbox/work");
        println!("  {} ({})", profile.language, profile.extensions.join(", "));
        println!("    image:   {}", profile.image);
        if let Some(compile) = &profile.compile {
            println!("    compile: {}", compile.build(&layout).join(" "));
        }
        println!("    run:     {}", profile.run.build(&layout).join(" "));
        println!();
    }
}
