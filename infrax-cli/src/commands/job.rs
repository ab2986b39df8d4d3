//! Job command handlers

use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use colored::*;
use infrax_client::NodeClient;
use infrax_core::domain::file::FileRef;
use infrax_core::domain::job::{JobRecord, JobState, ResourceLimits};
use infrax_core::dto::job::SubmitJob;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::Config;
use crate::id_resolver::resolve_job_id;
use crate::types::IdOrPrefix;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// Submit a job to the node
    Submit {
        /// App to run
        app: String,

        /// Arguments passed to the app
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Job ID (generated by the node when omitted)
        #[arg(long)]
        id: Option<Uuid>,

        /// Wall-clock timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Memory limit in bytes
        #[arg(long)]
        memory: Option<u64>,

        /// CPU time limit in seconds
        #[arg(long)]
        cpu: Option<u64>,

        /// Environment variable (KEY=VALUE), repeatable
        #[arg(short, long = "env", value_parser = parse_env_var)]
        env: Vec<(String, String)>,

        /// JSON input handed to the app
        #[arg(long)]
        input: Option<String>,

        /// Router file placed in the job's input directory (FILE_ID=PATH), repeatable
        #[arg(long = "file", value_parser = parse_file_ref)]
        files: Vec<FileRef>,
    },
    /// Get job details
    Get {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// List jobs
    List {
        /// Only jobs in this state (Queued, Running, Succeeded, Failed, Cancelled)
        #[arg(long)]
        state: Option<JobState>,
    },
    /// Cancel a queued or running job
    Cancel {
        /// Job ID or unambiguous prefix
        id: String,
    },
}

pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    let client = NodeClient::new(&config.node_url);

    match command {
        JobCommands::Submit {
            app,
            args,
            id,
            timeout,
            memory,
            cpu,
            env,
            input,
            files,
        } => {
            let input = input
                .map(|raw| serde_json::from_str(&raw).context("--input is not valid JSON"))
                .transpose()?;

            let req = SubmitJob {
                id,
                app,
                args,
                input,
                env: env.into_iter().collect::<HashMap<_, _>>(),
                limits: ResourceLimits {
                    cpu_seconds: cpu,
                    memory_bytes: memory,
                    timeout_seconds: timeout,
                },
                files,
            };
            submit_job(&client, req).await
        }
        JobCommands::Get { id } => get_job(&client, &id).await,
        JobCommands::List { state } => list_jobs(&client, state).await,
        JobCommands::Cancel { id } => cancel_job(&client, &id).await,
    }
}

async fn submit_job(client: &NodeClient, req: SubmitJob) -> Result<()> {
    println!("{}", format!("Submitting {}...", req.app).bold());

    let job = client.submit_job(req).await?;

    println!("{} Job queued", "✓".green());
    println!("  ID:    {}", job.id().to_string().cyan());
    println!("  State: {}", colorize_state(job.state));

    Ok(())
}

async fn get_job(client: &NodeClient, id: &str) -> Result<()> {
    let uuid = resolve_job_id(client, &IdOrPrefix::parse(id)).await?;
    let job = client.get_job(uuid).await?;

    print_job_details(&job);

    Ok(())
}

async fn list_jobs(client: &NodeClient, state: Option<JobState>) -> Result<()> {
    let jobs = client.list_jobs(state).await?;

    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(())
}

async fn cancel_job(client: &NodeClient, id: &str) -> Result<()> {
    let uuid = resolve_job_id(client, &IdOrPrefix::parse(id)).await?;
    let job = client.cancel_job(uuid).await?;

    println!("{} Job {} cancelled", "✓".green(), job.id().to_string().cyan());

    Ok(())
}

/// Parse a KEY=VALUE pair
fn parse_env_var(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        return Err(anyhow!("empty variable name in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

/// FILE_ID=PATH, PATH relative to the job's input directory
fn parse_file_ref(raw: &str) -> Result<FileRef> {
    let (id, path) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected FILE_ID=PATH, got '{}'", raw))?;
    if id.is_empty() {
        return Err(anyhow!("empty file id in '{}'", raw));
    }

    let file = match path.rsplit_once('/') {
        Some((dir, name)) => FileRef::new(id, name).in_dir(dir),
        None => FileRef::new(id, path),
    };
    if file.relative_path().is_none() {
        return Err(anyhow!("'{}' is not a relative path inside the job", path));
    }
    Ok(file)
}

fn print_job_summary(job: &JobRecord) {
    println!("  {} Job {}", "▸".cyan(), job.id().to_string().dimmed());
    println!("    App:       {}", job.request.app);
    println!("    State:     {}", colorize_state(job.state));
    println!(
        "    Submitted: {}",
        job.request
            .submitted_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    if let Some(failure) = &job.failure {
        println!("    Failure:   {}", failure.to_string().red());
    }
    println!();
}

fn print_job_details(job: &JobRecord) {
    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.id().to_string().cyan());
    println!("  App:         {}", job.request.app);
    if !job.request.args.is_empty() {
        println!("  Args:        {}", job.request.args.join(" "));
    }
    println!("  State:       {}", colorize_state(job.state));
    println!(
        "  Submitted:   {}",
        job.request.submitted_at.format("%Y-%m-%d %H:%M:%S")
    );

    if let Some(started) = job.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(finished) = job.finished_at {
        println!("  Finished:    {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(seconds) = job.execution_time_secs() {
        println!("  Duration:    {:.2}s", seconds);
    }

    if let Some(code) = job.exit_code {
        println!("  Exit Code:   {}", code);
    }

    if job.retry_count > 0 {
        println!("  Retries:     {}", job.retry_count);
    }

    if let Some(location) = &job.output_location {
        println!("  Workspace:   {}", location.dimmed());
    }

    if !job.request.env.is_empty() {
        println!("\n{}", "Environment:".bold());
        for (key, value) in &job.request.env {
            println!("  {} = {}", key.cyan(), value);
        }
    }

    if let Some(failure) = &job.failure {
        println!("\n{}", "Failure:".bold());
        println!("{}", failure.to_string().red());
    }
}

fn colorize_state(state: JobState) -> ColoredString {
    let label = state.as_str();
    match state {
        JobState::Queued => label.yellow(),
        JobState::Running => label.cyan(),
        JobState::Succeeded => label.green(),
        JobState::Failed => label.red(),
        JobState::Cancelled => label.dimmed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_var() {
        assert_eq!(
            parse_env_var("MODE=fast").unwrap(),
            ("MODE".to_string(), "fast".to_string())
        );
        assert_eq!(
            parse_env_var("EXPR=a=b").unwrap(),
            ("EXPR".to_string(), "a=b".to_string())
        );
        assert!(parse_env_var("MODE").is_err());
        assert!(parse_env_var("=fast").is_err());
    }

    #[test]
    fn test_parse_file_ref() {
        let file = parse_file_ref("f-1=data.csv").unwrap();
        assert_eq!(file.id, "f-1");
        assert_eq!(file.name, "data.csv");
        assert_eq!(file.path, None);

        let file = parse_file_ref("f-2=nested/dir/weights.bin").unwrap();
        assert_eq!(file.name, "weights.bin");
        assert_eq!(file.path.as_deref(), Some("nested/dir"));

        assert!(parse_file_ref("data.csv").is_err());
        assert!(parse_file_ref("=data.csv").is_err());
        assert!(parse_file_ref("f-3=../escape").is_err());
        assert!(parse_file_ref("f-4=/etc/passwd").is_err());
    }
}
