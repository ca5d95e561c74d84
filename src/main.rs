use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, Local};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use quickpost::client::{HttpPublisher, LogTrace, PostSubmitter};
use quickpost::config::{self, Config};
use quickpost::credentials::{Credential, CredentialStore};
use quickpost::db;
use quickpost::lease::{self, Lease};
use quickpost::model::{ImageAttachment, PostDraft};
use quickpost::note;
use quickpost::publish::{ImmediatePublisher, PublishReport};
use quickpost::queue::QueueStore;
use quickpost::sync::{self, Backoff, DrainOutcome, DriverState, SyncDriver, SyncTrigger};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publish a note now; queue it for background sync if sending fails
    Publish(PublishArgs),
    /// Remember the endpoint password
    Login {
        #[arg(long)]
        password: String,
    },
    /// Forget the stored password
    Logout,
    /// Inspect and manage queued posts
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Run one sync pass over the queue and exit
    Sync,
    /// Keep syncing in the background, retrying on reconnect, until Ctrl-C
    Daemon,
    /// List published posts
    Posts,
}

#[derive(Debug, ClapArgs)]
struct PublishArgs {
    #[arg(long)]
    title: Option<String>,
    /// Tag to attach; repeatable
    #[arg(long = "tag")]
    tag: Vec<String>,
    /// Comma-separated tags
    #[arg(long)]
    tags: Option<String>,
    /// Markdown body
    #[arg(long, conflicts_with = "file")]
    body: Option<String>,
    /// Read the Markdown body from a file
    #[arg(long)]
    file: Option<PathBuf>,
    /// Image to upload alongside the note
    #[arg(long)]
    image: Option<PathBuf>,
    /// Destination directory for the image in the site repository
    #[arg(long)]
    image_path: Option<String>,
    /// Shortcode template; IMAGE_NAME is replaced by the image file name
    #[arg(long)]
    shortcode: Option<String>,
    /// Endpoint password (falls back to the stored one)
    #[arg(long)]
    password: Option<String>,
    /// Store --password for later runs and background sync
    #[arg(long)]
    remember: bool,
    /// Prepend a title/tags/date frontmatter header to the body
    #[arg(long)]
    frontmatter: bool,
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// Show posts waiting to be published, oldest first
    List,
    /// Show posts the endpoint rejected permanently
    Failed,
    /// Move a rejected post back to the end of the queue
    Requeue { id: i64 },
    /// Delete a rejected post
    Discard { id: i64 },
}

struct Services {
    cfg: Config,
    store: QueueStore,
    credentials: CredentialStore,
    client: Arc<HttpPublisher>,
}

impl Services {
    async fn open(cfg: Config) -> Result<Self> {
        let store = QueueStore::open(&cfg.database_url()).await?;
        let credentials = CredentialStore::new(store.pool().clone());
        let client = Arc::new(HttpPublisher::from_config(&cfg)?);
        Ok(Self {
            cfg,
            store,
            credentials,
            client,
        })
    }

    fn driver(&self, connectivity: tokio::sync::watch::Receiver<bool>) -> SyncDriver {
        let submitter: Arc<dyn PostSubmitter> = self.client.clone();
        SyncDriver::new(
            self.store.clone(),
            self.credentials.clone(),
            submitter,
            Backoff::from_policy(&self.cfg.sync),
            connectivity,
        )
    }

    async fn online(&self) -> bool {
        sync::probe_once(self.client.base_url(), self.cfg.endpoint.connect_timeout()).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let services = Services::open(cfg).await?;

    match args.command {
        Command::Publish(publish) => run_publish(&services, publish).await,
        Command::Login { password } => {
            let credential =
                Credential::new(password).ok_or_else(|| anyhow!("password must be non-empty"))?;
            services.credentials.save(&credential, true).await?;
            let queued = services.store.len().await?;
            println!("Password saved.");
            if queued > 0 {
                println!("{} post(s) queued; run `quickpost sync` to send them.", queued);
            }
            Ok(())
        }
        Command::Logout => {
            services.credentials.forget().await?;
            println!("Password forgotten.");
            Ok(())
        }
        Command::Queue(cmd) => run_queue(&services, cmd).await,
        Command::Sync => run_sync(&services).await,
        Command::Daemon => run_daemon(&services).await,
        Command::Posts => {
            let posts = services.client.list_posts().await.context("failed to fetch posts")?;
            if posts.is_empty() {
                println!("No posts found.");
            }
            for post in posts {
                println!("{}\n  {}\n  {}", post.name, post.path, post.url);
            }
            Ok(())
        }
    }
}

async fn compose(services: &Services, args: &PublishArgs) -> Result<PostDraft> {
    let mut tags = args.tag.clone();
    if let Some(raw) = &args.tags {
        tags.extend(note::split_tags(raw));
    }

    let mut body = match &args.file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read note: {}", path.display()))?,
        None => args.body.clone().unwrap_or_default(),
    };

    let shortcode_template = args
        .shortcode
        .clone()
        .unwrap_or_else(|| services.cfg.publish.shortcode_template.clone());
    let image = match &args.image {
        Some(path) => {
            let image = ImageAttachment::from_file(path).await?;
            body = note::append_shortcode(
                &body,
                &note::expand_shortcode(&shortcode_template, image.name()),
            );
            Some(image)
        }
        None => None,
    };

    let title = args.title.clone().unwrap_or_default();
    if args.frontmatter {
        let now: DateTime<FixedOffset> = Local::now().into();
        let header = note::frontmatter(&title, &tags, Some(now), Some(now));
        body = format!("{}\n{}", header, note::strip_frontmatter(&body));
    }

    let mut draft = PostDraft::new(body)
        .with_title(title)
        .with_tags(tags)
        .with_image_path(
            args.image_path
                .clone()
                .unwrap_or_else(|| services.cfg.publish.image_path.clone()),
        )
        .with_shortcode_template(shortcode_template);
    if let Some(image) = image {
        draft = draft.with_image(image);
    }
    Ok(draft)
}

async fn run_publish(services: &Services, args: PublishArgs) -> Result<()> {
    let credential = match args.password.as_deref().and_then(Credential::new) {
        Some(credential) => {
            if args.remember {
                services.credentials.save(&credential, true).await?;
            }
            Some(credential)
        }
        None => services.credentials.load().await?,
    };
    let draft = compose(services, &args).await?;

    let submitter: Arc<dyn PostSubmitter> = services.client.clone();
    if lease::is_held(services.store.pool(), lease::DAEMON).await? {
        // A running daemon owns background sync; only the immediate attempt happens here.
        let publisher =
            ImmediatePublisher::new(services.store.clone(), submitter, Arc::new(DaemonHandoff));
        let report = publisher.publish(draft, credential.as_ref(), &print_line).await?;
        return print_report(report, None);
    }

    let (connectivity_tx, connectivity_rx) = sync::connectivity_channel(services.online().await);
    let (handle, driver) = services.driver(connectivity_rx).spawn();
    let trigger: Arc<dyn SyncTrigger> = Arc::new(handle.clone());
    let publisher = ImmediatePublisher::new(services.store.clone(), submitter, trigger);
    let result = publisher.publish(draft, credential.as_ref(), &print_line).await;

    handle.shutdown().await;
    drop(connectivity_tx);
    match driver.await {
        Ok(Err(err)) => error!(?err, "sync driver failed"),
        Err(err) => error!(?err, "sync driver panicked"),
        Ok(Ok(())) => {}
    }
    print_report(result?, handle.status().last_outcome)
}

fn print_line(line: &str) {
    println!("{}", line);
}

/// Leaves queued posts to the daemon process, which picks them up on its next queue check.
struct DaemonHandoff;

impl SyncTrigger for DaemonHandoff {
    fn arm(&self) {
        info!("sync daemon is running; queued post left to it");
    }
}

fn print_report(report: PublishReport, background: Option<DrainOutcome>) -> Result<()> {
    match report {
        PublishReport::Published { message, path } => {
            println!("Published: {}", message);
            if let Some(path) = path {
                println!("-> Published at:\n  {}", path);
            }
        }
        PublishReport::Queued { id, reason } => {
            println!("Queued as #{} ({})", id, reason);
            if let Some(DrainOutcome::Drained { published, .. }) = background {
                println!("Background sync published {} post(s).", published);
            }
        }
        PublishReport::Rejected { reason } => {
            return Err(anyhow!("Rejected: {}", reason));
        }
    }
    Ok(())
}

async fn run_queue(services: &Services, cmd: QueueCommand) -> Result<()> {
    match cmd {
        QueueCommand::List => {
            let posts = services.store.list_all().await?;
            if posts.is_empty() {
                println!("Queue is empty.");
            }
            for p in posts {
                println!(
                    "#{:<5} {}  {}{}",
                    p.id,
                    p.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
                    p.post.display_title(),
                    p.post
                        .image_name()
                        .map(|n| format!("  [image: {}]", n))
                        .unwrap_or_default()
                );
            }
        }
        QueueCommand::Failed => {
            let failed = services.store.list_failed().await?;
            if failed.is_empty() {
                println!("No rejected posts.");
            }
            for f in failed {
                println!(
                    "#{:<5} {}  {}  ({})",
                    f.id,
                    f.failed_at.format("%Y-%m-%d %H:%M:%S"),
                    f.post.display_title(),
                    f.reason
                );
            }
        }
        QueueCommand::Requeue { id } => match services.store.requeue_failed(id).await? {
            Some(new_id) => println!("Requeued #{} as #{}", id, new_id),
            None => return Err(anyhow!("no rejected post #{}", id)),
        },
        QueueCommand::Discard { id } => {
            if !services.store.discard_failed(id).await? {
                return Err(anyhow!("no rejected post #{}", id));
            }
            println!("Discarded #{}", id);
        }
    }
    Ok(())
}

async fn run_sync(services: &Services) -> Result<()> {
    let remaining = services.store.len().await?;
    info!(remaining, "starting sync");
    if remaining == 0 {
        println!("Queue is empty.");
        return Ok(());
    }
    let outcome = sync::drain_queue(
        &services.store,
        &services.credentials,
        services.client.as_ref(),
        &LogTrace,
    )
    .await?;
    match outcome {
        DrainOutcome::Drained { published, parked } => {
            db::clear_retry_schedule(services.store.pool()).await?;
            println!("Published {} post(s), {} rejected.", published, parked);
        }
        DrainOutcome::Halted {
            published,
            post_id,
            reason,
            ..
        } => {
            println!(
                "Published {} post(s); stopped at #{}: {}",
                published, post_id, reason
            );
        }
        DrainOutcome::MissingCredential => {
            return Err(anyhow!("no stored password; run `quickpost login` first"));
        }
        DrainOutcome::Busy => {
            println!("Another quickpost process is syncing; nothing sent.");
        }
        DrainOutcome::Failed { reason } => {
            return Err(anyhow!("sync failed: {}", reason));
        }
    }
    Ok(())
}

async fn run_daemon(services: &Services) -> Result<()> {
    let interval = services.cfg.sync.probe_interval();
    let ttl = (interval * 3).max(Duration::from_secs(30));
    let Some(presence) = Lease::acquire(services.store.pool(), lease::DAEMON, ttl).await? else {
        return Err(anyhow!("another quickpost daemon is already running"));
    };

    let (connectivity_tx, connectivity_rx) = sync::connectivity_channel(services.online().await);
    let probe = tokio::spawn(sync::probe_connectivity(
        services.client.base_url().clone(),
        interval,
        connectivity_tx,
    ));
    let (handle, driver) = services.driver(connectivity_rx).spawn();
    info!("sync daemon running");

    // Other processes append without arming this driver; notice their posts on each tick.
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
            _ = ticker.tick() => {
                if !presence.renew().await? {
                    warn!("daemon lease taken over; stopping");
                    break;
                }
                if handle.status().state == DriverState::Idle
                    && !services.store.is_empty().await?
                    && services.credentials.load().await?.is_some()
                {
                    handle.arm();
                }
            }
        }
    }

    info!("shutting down");
    handle.shutdown().await;
    probe.abort();
    driver.await??;
    presence.release().await?;
    Ok(())
}
