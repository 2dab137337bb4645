use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use storefront::config::StorefrontConfig;
use storefront::media::{ImageOptimizer, ImageStager, Optimization};
use storefront::state::events::ChangeBus;
use storefront::storage::{FilesystemStore, UrlResolver};
use storefront::{CatalogSync, Library, Product, ProductFields};

#[derive(Parser, Debug)]
#[command(name = "storefront")]
#[command(about = "Storefront catalog administration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(flatten)]
    Catalog(CatalogCommand),
    /// Optimize an image file locally, without uploading it
    Optimize { input: PathBuf, output: PathBuf },
}

/// Commands that open the catalog
#[derive(Subcommand, Debug)]
enum CatalogCommand {
    /// List the catalog, newest first
    List,
    /// Show one product as JSON
    Show { id: i64 },
    /// Add a product
    Add(ProductArgs),
    /// Replace all fields of a product
    Update {
        id: i64,
        #[command(flatten)]
        fields: ProductArgs,
    },
    /// Delete a product
    Delete { id: i64 },
}

#[derive(Args, Debug)]
struct ProductArgs {
    #[arg(long)]
    name: String,
    #[arg(long, allow_negative_numbers = true)]
    price: f64,
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    stock: i64,
    #[arg(long)]
    description: Option<String>,
    /// Photo to optimize and upload
    #[arg(long, conflicts_with = "image_key")]
    image: Option<PathBuf>,
    /// Storage key of an already uploaded photo
    #[arg(long)]
    image_key: Option<String>,
}

fn print_row(product: &Product) {
    println!(
        "{:>5}  {:<32} {:>10.2} {:>6}  {}",
        product.id, product.name, product.price, product.stock, product.image_url
    );
}

/// Run the optimizer on a local file and write the result
async fn optimize_file(optimizer: &ImageOptimizer, input: &Path, output: &Path) -> anyhow::Result<()> {
    let blob = tokio::fs::read(input)
        .await
        .with_context(|| format!("failed to read {}", input.display()))?;
    let before = blob.len();

    let optimized = optimizer.optimize_async(blob).await?;
    tokio::fs::write(output, &optimized.bytes)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;

    match optimized.optimization {
        Optimization::PassedThrough => println!("{} bytes, already small enough", before),
        Optimization::Reencoded { width, height, .. } => {
            println!("{} -> {} bytes, {}x{}", before, optimized.len(), width, height)
        }
    }
    Ok(())
}

/// Wired-up catalog client
struct Storefront {
    catalog: CatalogSync,
    stager: ImageStager,
}

impl Storefront {
    async fn init(config: &StorefrontConfig) -> anyhow::Result<Self> {
        let bus = ChangeBus::new(config.sync.event_capacity);

        let db_path = config.database.db_path();
        let library = Arc::new(
            Library::open(&db_path)
                .with_context(|| format!("failed to open catalog at {}", db_path.display()))?
                .with_change_bus(bus.clone()),
        );

        let store = Arc::new(
            FilesystemStore::new(&config.storage)
                .await
                .context("failed to prepare image storage")?,
        );
        let resolver = UrlResolver::new(store.clone(), config.storage.placeholder_url.clone());

        let catalog = CatalogSync::new(library.clone(), resolver, &config.sync).with_change_feed(&bus);
        let stager = ImageStager::new(ImageOptimizer::new(config.optimizer.clone()), store);

        let count = library.product_count().await?;
        info!(products = count, "storefront initialized");

        Ok(Storefront { catalog, stager })
    }

    /// Build product fields, uploading the photo first if one was given
    async fn fields(&self, args: ProductArgs) -> anyhow::Result<ProductFields> {
        let image_key = match args.image {
            Some(path) => {
                let blob = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let staged = self.stager.optimize_and_stage(blob).await?;
                Some(self.stager.upload(&staged).await?)
            }
            None => args.image_key,
        };

        Ok(ProductFields {
            name: args.name,
            price: args.price,
            description: args.description,
            stock: args.stock,
            image_key,
        })
    }

    async fn run(&self, command: CatalogCommand) -> anyhow::Result<()> {
        match command {
            CatalogCommand::List => {
                let snapshot = self.catalog.load().await?;
                for product in snapshot.iter() {
                    print_row(product);
                }
                println!("{} products", snapshot.len());
            }
            CatalogCommand::Show { id } => {
                let product = self.catalog.fetch_product(id).await?;
                println!("{}", serde_json::to_string_pretty(&product)?);
            }
            CatalogCommand::Add(args) => {
                let fields = self.fields(args).await?;
                let record = self.catalog.create(fields).await?;
                println!("created product {}", record.id);
                self.settle().await;
            }
            CatalogCommand::Update { id, fields } => {
                let fields = self.fields(fields).await?;
                self.catalog.update(id, fields).await?;
                println!("updated product {}", id);
                self.settle().await;
            }
            CatalogCommand::Delete { id } => {
                self.catalog.delete(id).await?;
                println!("deleted product {}", id);
                self.settle().await;
            }
        }
        Ok(())
    }

    /// Wait for the reload queued by a mutation; the mutation itself already succeeded
    async fn settle(&self) {
        match self.catalog.load().await {
            Ok(snapshot) => info!(products = snapshot.len(), "catalog refreshed"),
            Err(err) => warn!(error = %err, "catalog refresh after mutation failed"),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = StorefrontConfig::load().context("failed to load configuration")?;

    match cli.command {
        // Local only, no catalog needed
        Command::Optimize { input, output } => {
            optimize_file(&ImageOptimizer::new(config.optimizer.clone()), &input, &output).await
        }
        Command::Catalog(command) => Storefront::init(&config).await?.run(command).await,
    }
}
