use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use finkb_core::layout::Layout;
use finkb_core::runner::{OrchestratorConfig, Runner, DEFAULT_STEPS};

#[derive(Parser)]
#[command(name = "finkb", about = "Methodology knowledge-base pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline orchestrator on one methodology
    Run {
        /// Book/methodology id (expects sources/<id>/)
        #[arg(long)]
        book_id: Option<String>,
        /// Path to a source directory (alternative to --book-id)
        #[arg(long)]
        source_path: Option<PathBuf>,
        /// Single source id under sources/
        #[arg(long)]
        source_id: Option<String>,
        /// Bundle id under data/bundles/
        #[arg(long)]
        bundle_id: Option<String>,
        /// Detect the methodology from the source manifest
        #[arg(long)]
        auto_bundle: bool,
        /// Minimum confidence for auto-bundle detection
        #[arg(long, default_value_t = 0.3)]
        min_bundle_confidence: f64,
        /// Comma-separated steps: B,C,D,Gate,G,E,F
        #[arg(long, default_value = DEFAULT_STEPS)]
        steps: String,
        /// Run id (default kb_<timestamp>)
        #[arg(long)]
        run_id: Option<String>,
        /// Stop on Gate FAIL (default)
        #[arg(long)]
        require_gate_pass: bool,
        /// Continue even if the Gate reports FAIL
        #[arg(long, conflicts_with = "require_gate_pass")]
        no_require_gate_pass: bool,
        /// Prefer GigaChat for the outline builder
        #[arg(long)]
        use_gigachat: bool,
        /// Pass --skip-qa to the publish step
        #[arg(long)]
        skip_qa: bool,
        /// Pass --reconcile to the glossary sync step
        #[arg(long)]
        g_reconcile: bool,
        /// Pass --dry-run to the glossary sync step
        #[arg(long)]
        g_dry_run: bool,
        /// Repo root (default: current directory)
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
    /// Run the orchestrator over many books and write a batch report
    Batch {
        /// Comma-separated book ids
        #[arg(long, conflicts_with = "auto")]
        books: Option<String>,
        /// Auto-discover books with extracted blocks under sources/
        #[arg(long)]
        auto: bool,
        #[arg(long, default_value = DEFAULT_STEPS)]
        steps: String,
        /// Batch id (default batch_<timestamp>)
        #[arg(long)]
        batch_id: Option<String>,
        #[arg(long)]
        no_require_gate_pass: bool,
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
    /// Deterministic quality gate for an outline (exit 0 PASS, 2 FAIL)
    Gate {
        /// Path to the outline YAML
        #[arg(long)]
        input: PathBuf,
        /// Optional path for the JSON report
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Compile an outline into canonical YAML and markdown docs
    Compile {
        /// Book id (expects work/<id>/outline_<id>.yaml)
        #[arg(long, conflicts_with = "outline")]
        book: Option<String>,
        /// Explicit outline path; the book id is its parent directory name
        #[arg(long)]
        outline: Option<PathBuf>,
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
    /// QA review of a compiled methodology (exit 0 approved, 1 rejected)
    Review {
        /// Book id
        #[arg(long)]
        book: String,
        /// Enable the LLM reasoning layer
        #[arg(long)]
        use_llm: bool,
        /// Glossary directory or index file for term checks
        #[arg(long)]
        glossary: Option<PathBuf>,
        /// Schema override (default schemas/methodology_compiled.schema.json)
        #[arg(long)]
        schema: Option<PathBuf>,
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
    /// Publish a compiled methodology into the graph database
    Publish {
        /// Methodology id
        methodology_id: String,
        /// Publish even without QA approval
        #[arg(long)]
        skip_qa: bool,
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
    /// Sync canonical glossary terms into the graph
    GlossarySync {
        #[arg(long)]
        base_dir: Option<PathBuf>,
        /// Glossary directory (default data/glossary)
        #[arg(long)]
        glossary_dir: Option<PathBuf>,
        /// Reconcile needs_definition stubs against canonical terms
        #[arg(long)]
        reconcile: bool,
        /// Report only, write nothing
        #[arg(long)]
        dry_run: bool,
    },
    /// Render the release summary for a finished run
    Summary {
        #[arg(long)]
        manifest: PathBuf,
        /// Output path (default: <manifest_dir>/release/summary.md)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn layout_from(base_dir: Option<PathBuf>) -> Layout {
    match base_dir {
        Some(dir) => Layout::new(dir),
        None => Layout::current(),
    }
}

/// Resolve the methodology id and its source paths from the run flags.
fn resolve_sources(
    layout: &Layout,
    book_id: Option<String>,
    source_path: Option<PathBuf>,
    source_id: Option<String>,
    bundle_id: Option<String>,
    auto_bundle: bool,
    min_confidence: f64,
) -> Result<(String, Vec<PathBuf>)> {
    use finkb_core::bundles;

    if let Some(bundle_id) = bundle_id {
        let (methodology_id, paths) = bundles::bundle_sources(layout, &bundle_id)?;
        println!(
            "Bundle: {bundle_id} -> methodology: {methodology_id}, sources: {:?}",
            paths
                .iter()
                .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
                .collect::<Vec<_>>()
        );
        return Ok((methodology_id, paths));
    }

    if auto_bundle {
        let source = match (&source_id, &source_path) {
            (Some(id), _) => layout.source_dir(id),
            (None, Some(path)) => path.clone(),
            (None, None) => {
                anyhow::bail!("--auto-bundle requires --source-id or --source-path")
            }
        };
        let sid = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let manifest = bundles::load_source_manifest(layout, &sid)?
            .ok_or_else(|| anyhow::anyhow!("source_manifest.json not found in {}", source.display()))?;
        let methodology_id = bundles::pick_methodology_id(&manifest, min_confidence)
            .ok_or_else(|| {
                anyhow::anyhow!("No methodology detected in {} (confidence too low)", source.display())
            })?;
        println!(
            "Auto-detected methodology: {methodology_id} from source: {sid} (confidence: {:.0}%)",
            manifest.signals.confidence * 100.0
        );
        return Ok((methodology_id, vec![source]));
    }

    if let Some(source_id) = source_id {
        let path = layout.source_dir(&source_id);
        return Ok((book_id.unwrap_or(source_id), vec![path]));
    }

    if let Some(path) = source_path {
        let id = book_id.unwrap_or_else(|| {
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string()
        });
        return Ok((id, vec![path]));
    }

    if let Some(book_id) = book_id {
        let path = layout.source_dir(&book_id);
        return Ok((book_id, vec![path]));
    }

    anyhow::bail!("provide --book-id, --source-path, --source-id, --bundle-id, or --auto-bundle")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("finkb=info".parse()?),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            book_id,
            source_path,
            source_id,
            bundle_id,
            auto_bundle,
            min_bundle_confidence,
            steps,
            run_id,
            require_gate_pass: _,
            no_require_gate_pass,
            use_gigachat,
            skip_qa,
            g_reconcile,
            g_dry_run,
            base_dir,
        } => {
            let layout = layout_from(base_dir);
            let mut config = finkb_config::Config::load(layout.root())?;
            config.llm.use_gigachat = config.llm.use_gigachat || use_gigachat;

            let (methodology_id, source_paths) = resolve_sources(
                &layout,
                book_id,
                source_path,
                source_id,
                bundle_id,
                auto_bundle,
                min_bundle_confidence,
            )?;
            let sources: Option<Vec<String>> = if source_paths.len() > 1 {
                Some(
                    source_paths
                        .iter()
                        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
                        .collect(),
                )
            } else {
                None
            };

            let steps = finkb_core::runner::parse_steps(&steps)?;
            let chat = if steps.iter().any(|s| s == "B") {
                match finkb_llm::create_client(&config.llm) {
                    Ok(client) => Some(client),
                    Err(e) => {
                        tracing::warn!(error = %e, "No LLM client; step B will fail if reached");
                        None
                    }
                }
            } else {
                None
            };

            let cfg = OrchestratorConfig {
                book_id: methodology_id.clone(),
                source_path: source_paths
                    .first()
                    .cloned()
                    .unwrap_or_else(|| layout.source_dir(&methodology_id)),
                sources,
                run_id: run_id.unwrap_or_else(finkb_core::manifest::default_run_id),
                steps,
                require_gate_pass: !no_require_gate_pass,
                use_gigachat,
                skip_qa_for_publish: skip_qa,
                g_reconcile,
                g_dry_run,
            };

            let invoker =
                finkb_core::invoker::SelfInvoker::new(config.pipeline.step_timeout_secs)?;
            let mut runner = Runner::new(cfg, layout, &invoker, chat.as_deref())?;
            let code = runner.run().await?;
            std::process::exit(code);
        }

        Commands::Batch {
            books,
            auto,
            steps,
            batch_id,
            no_require_gate_pass,
            base_dir,
        } => {
            let layout = layout_from(base_dir);
            let config = finkb_config::Config::load(layout.root())?;

            let books: Vec<String> = if auto {
                let found = finkb_core::batch::discover_books(&layout)?;
                if found.is_empty() {
                    eprintln!("No books found in {}", layout.sources_dir().display());
                    std::process::exit(1);
                }
                println!("Auto-discovered {} books: {}", found.len(), found.join(", "));
                found
            } else {
                books
                    .unwrap_or_default()
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            };
            if books.is_empty() {
                eprintln!("No books to process (use --books or --auto)");
                std::process::exit(1);
            }

            let options = finkb_core::batch::BatchOptions {
                steps,
                batch_id: batch_id.unwrap_or_else(finkb_core::batch::default_batch_id),
                require_gate_pass: !no_require_gate_pass,
            };
            let invoker =
                finkb_core::invoker::SelfInvoker::new(config.pipeline.step_timeout_secs)?;
            let results =
                finkb_core::batch::run_batch(&layout, &invoker, &books, &options).await?;

            let failed = results.iter().filter(|r| !r.success).count();
            println!(
                "Batch {} finished: {}/{} succeeded",
                options.batch_id,
                results.len() - failed,
                results.len()
            );
            std::process::exit(if failed > 0 { 1 } else { 0 });
        }

        Commands::Gate { input, report } => {
            let outline = finkb_core::outline::Outline::load(&input)?;
            let gate = finkb_core::gate::run_gate(&outline);
            println!("{}", serde_json::to_string_pretty(&gate)?);
            if let Some(report_path) = report {
                gate.write(&report_path)?;
            }
            std::process::exit(gate.exit_code());
        }

        Commands::Compile {
            book,
            outline,
            base_dir,
        } => {
            let layout = layout_from(base_dir);
            let book_id = match (book, &outline) {
                (Some(book), _) => book,
                (None, Some(path)) => path
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                    .map(String::from)
                    .ok_or_else(|| anyhow::anyhow!("Cannot infer book id from {}", path.display()))?,
                (None, None) => anyhow::bail!("provide --book or --outline"),
            };
            let output = finkb_core::compiler::compile_methodology(&layout, &book_id)?;
            println!("Compiled: {}", output.yaml_path.display());
            println!("Docs:     {}", output.docs_dir.display());
            println!(
                "Stages: {}, tools: {}, indicators: {}, rules: {}",
                output.methodology.structure.stages.len(),
                output.methodology.structure.tools.len(),
                output.methodology.structure.indicators.len(),
                output.methodology.structure.rules.len()
            );
        }

        Commands::Review {
            book,
            use_llm,
            glossary,
            schema,
            base_dir,
        } => {
            let layout = layout_from(base_dir);
            let config = finkb_config::Config::load(layout.root())?;

            let chat = if use_llm {
                match finkb_llm::create_client(&config.llm) {
                    Ok(client) => Some(client),
                    Err(e) => {
                        eprintln!("Reasoning layer unavailable: {e}");
                        None
                    }
                }
            } else {
                None
            };

            let options = finkb_core::qa::ReviewOptions {
                use_llm,
                glossary_dir: glossary,
                schema_path: schema,
            };
            match finkb_core::qa::validate_methodology(&layout, &book, &options, chat.as_deref())
                .await
            {
                Ok(result) => {
                    println!(
                        "approved: {} | score: {}/100 | blockers: {} majors: {} minors: {}",
                        result.approved,
                        result.score,
                        result.summary.blockers,
                        result.summary.majors,
                        result.summary.minors
                    );
                    println!("out: {}", layout.qa_work_dir(&book).display());
                    std::process::exit(result.exit_code());
                }
                Err(e) => {
                    eprintln!("QA review failed: {e:#}");
                    std::process::exit(2);
                }
            }
        }

        Commands::Publish {
            methodology_id,
            skip_qa,
            base_dir,
        } => {
            let layout = layout_from(base_dir);
            let config = finkb_config::Config::load(layout.root())?;
            let store = finkb_graph::ArangoStore::new(&config.arango);

            let options = finkb_core::publisher::PublishOptions {
                skip_qa,
                ..finkb_core::publisher::PublishOptions::default()
            };
            match finkb_core::publisher::publish_methodology(
                &layout,
                &store,
                &methodology_id,
                &options,
            )
            .await
            {
                Ok(report) => {
                    let entities: u64 = report
                        .entities
                        .values()
                        .map(|s| s.inserted + s.updated)
                        .sum();
                    let edges: u64 =
                        report.edges.values().map(|s| s.inserted + s.updated).sum();
                    println!(
                        "Published {methodology_id}: {entities} entities, {edges} edges, {} warnings",
                        report.warnings.len()
                    );
                    println!(
                        "Receipt: {}",
                        layout.publish_receipt_path(&methodology_id).display()
                    );
                }
                Err(e) => {
                    eprintln!("Publish failed: {e:#}");
                    std::process::exit(1);
                }
            }
        }

        Commands::GlossarySync {
            base_dir,
            glossary_dir,
            reconcile,
            dry_run,
        } => {
            let layout = layout_from(base_dir);
            let config = finkb_config::Config::load(layout.root())?;
            let store = finkb_graph::ArangoStore::new(&config.arango);

            let options = finkb_core::glossary_sync::SyncOptions {
                reconcile,
                dry_run,
                glossary_dir,
                ..finkb_core::glossary_sync::SyncOptions::default()
            };
            match finkb_core::glossary_sync::run_sync(&layout, &store, &options).await {
                Ok(report) => {
                    println!(
                        "Glossary sync: {} terms loaded, {} canonical docs ({} errors)",
                        report.loaded_terms,
                        report.prepared_docs,
                        report.errors.len()
                    );
                    if let Some(rec) = &report.result.reconciliation {
                        println!(
                            "Reconciled stubs: {} matched, {} unknown",
                            rec.matched, rec.unmatched
                        );
                    }
                    println!(
                        "Report: {}",
                        layout.glossary_sync_report_path().display()
                    );
                }
                Err(e) => {
                    eprintln!("Glossary sync failed: {e:#}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Summary { manifest, output } => {
            let output_path = output.unwrap_or_else(|| {
                manifest
                    .parent()
                    .map(|dir| dir.join("release").join("summary.md"))
                    .unwrap_or_else(|| PathBuf::from("summary.md"))
            });
            let summary = finkb_core::summary::publish_summary(&manifest, &output_path)?;
            println!(
                "Release summary generated: {} (run {}, exit {})",
                output_path.display(),
                summary.run_id,
                summary.exit_code
            );
        }
    }

    Ok(())
}
