use albumen::prelude::*;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "albumen")]
#[command(about = "Search and tag an image catalog", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Search the catalog.
    Search {
        #[command(flatten)]
        query: QueryArgs,

        #[arg(long = "all", help = "Require a tag from each of these subtrees")]
        all_tags: Vec<TagName>,

        #[arg(long = "any", help = "Require a tag from any of these subtrees")]
        any_tags: Vec<TagName>,

        #[arg(long = "none", help = "Exclude images tagged within these subtrees")]
        no_tags: Vec<TagName>,

        #[arg(long, conflicts_with = "untagged", help = "Only images with at least one tag")]
        tagged: bool,

        #[arg(long, help = "Only images without tags")]
        untagged: bool,
    },

    /// Print the SQL a filter compiles to, without connecting.
    Explain {
        #[command(flatten)]
        query: QueryArgs,

        #[arg(long, default_value = "sqlite", help = "sqlite or postgres")]
        dialect: Backend,
    },

    /// Add an image record.
    Add {
        #[arg(help = "Location id")]
        location: i64,

        #[arg(help = "Path relative to the location root")]
        path: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        rating: Option<i64>,

        #[arg(short, long = "tag", help = "Tag to attach; repeatable")]
        tags: Vec<TagName>,
    },

    #[command(subcommand)]
    Tag(TagCommand),

    /// Tag an image.
    TagImage {
        image: i64,
        #[arg(required = true)]
        tags: Vec<TagName>,
    },

    /// Remove tags from an image.
    UntagImage {
        image: i64,
        #[arg(required = true)]
        tags: Vec<TagName>,
    },
}

#[derive(Subcommand)]
pub enum TagCommand {
    /// Create a tag and its ancestors.
    Add {
        name: TagName,
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Move a tag subtree, merging into tags that already exist.
    Move {
        from: TagName,
        to: TagName,
        #[arg(long, help = "Move only the tag itself and leave its children in place")]
        no_cascade: bool,
    },

    /// Delete a tag. Descendants are kept unless --tree is given.
    Remove {
        name: TagName,
        #[arg(long)]
        tree: bool,
    },

    /// Show a tag with its children.
    Show { name: TagName },

    /// List every tag.
    List,
}

#[derive(Args)]
pub struct QueryArgs {
    #[arg(short, long, help = "Filter text, e.g. 'rating >= 4 AND title %=% heron'")]
    filter: Option<String>,

    #[arg(
        short,
        long,
        allow_hyphen_values = true,
        help = "Comma separated keys: field, -field, !field, field!, random"
    )]
    order: Option<OrderSpec>,

    #[arg(long, conflicts_with = "span")]
    limit: Option<u64>,

    #[arg(long, default_value_t = 0)]
    offset: u64,

    #[arg(long, help = "Return the first run of images within this span, e.g. 3d")]
    span: Option<Span>,
}

impl QueryArgs {
    fn filter(&self, schema: &Schema) -> Result<Option<Predicate>, AppError> {
        self.filter
            .as_deref()
            .map(|text| parse_filter(schema, text))
            .transpose()
            .map_err(AppError::from)
    }

    fn page(&self) -> Option<Pagination> {
        match (self.span, self.limit) {
            (Some(span), _) => Some(Pagination::span(span)),
            (None, Some(limit)) => Some(Pagination::count(limit, self.offset)),
            (None, None) => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let schema = Schema::images();

    if let Commands::Explain { query, dialect } = &cli.command {
        let filter = query.filter(&schema)?;
        let compiled = Compiler::new(dialect.dialect(), &schema).select(
            &[],
            filter.as_ref(),
            &query.order.clone().unwrap_or_default(),
            query.page().as_ref(),
        )?;

        println!("{}", compiled.sql);
        for (idx, param) in compiled.params.iter().enumerate() {
            println!("  {} = {param:?}", dialect.dialect().placeholder(idx + 1));
        }
        return Ok(());
    }

    let db = Database::connect(&Config::from_env()?).await?;

    match cli.command {
        Commands::Search {
            query,
            all_tags,
            any_tags,
            no_tags,
            tagged,
            untagged,
        } => {
            let mut request = SearchRequest::new()
                .all_tags(all_tags)
                .any_tags(any_tags)
                .no_tags(no_tags)
                .order(query.order.clone().unwrap_or_default());
            if let Some(filter) = query.filter(&schema)? {
                request = request.filter(FilterGroup::new(JoinStrategy::All).with(filter));
            }
            if tagged || untagged {
                request = request.tagged(tagged);
            }
            if let Some(page) = query.page() {
                request = request.page(page);
            }

            let page = search_images(&db, &request, &Mounts::new()).await?;
            for image in &page.images {
                let tags: Vec<String> = image.tags.iter().map(ToString::to_string).collect();
                println!(
                    "{}\t{}:{}\t[{}]",
                    image.record.id,
                    image.record.location,
                    image.record.path,
                    tags.join(", ")
                );
            }
            if let Some(Pagination::Count { offset, .. }) = page.next {
                println!("more results: --offset {offset}");
            }
        }
        Commands::Add {
            location,
            path,
            title,
            rating,
            tags,
        } => {
            let mut image = NewImage::new(location, path);
            if let Some(title) = title {
                image = image.title(title);
            }
            if let Some(rating) = rating {
                image = image.rating(rating);
            }

            let image = AddImageCommand::new(image).with_tags(tags).execute(&db).await?;
            println!("added image {}", image.record.id);
        }
        Commands::Tag(command) => run_tag(&db, command).await?,
        Commands::TagImage { image, tags } => {
            for tag in &tags {
                db.tag_image(image, tag).await?;
            }
        }
        Commands::UntagImage { image, tags } => {
            for tag in &tags {
                if !db.untag_image(image, tag).await? {
                    println!("image {image} was not tagged {tag}");
                }
            }
        }
        Commands::Explain { .. } => {}
    }

    Ok(())
}

async fn run_tag(db: &Database, command: TagCommand) -> Result<(), AppError> {
    match command {
        TagCommand::Add { name, description } => {
            let id = db.ensure_tag(&name).await?;
            if description.is_some() {
                db.set_tag_description(&name, description.as_deref()).await?;
            }
            println!("{name} ({id})");
        }
        TagCommand::Move {
            from,
            to,
            no_cascade,
        } => {
            let moved = if no_cascade {
                db.move_tag_only(&from, &to).await?
            } else {
                db.move_tag(&from, &to).await?
            };
            println!("moved {moved} tag(s) from {from} to {to}");
        }
        TagCommand::Remove { name, tree } => {
            if tree {
                let removed = db.remove_tag_tree(&name).await?;
                println!("removed {removed} tag(s)");
            } else {
                db.remove_tag(&name).await?;
            }
        }
        TagCommand::Show { name } => {
            let tag = db.get_tag(&name).await?;
            println!("{}", tag.tag.name);
            if let Some(description) = &tag.tag.description {
                println!("  {description}");
            }
            for child in &tag.children {
                println!("  {name}/{child}");
            }
        }
        TagCommand::List => {
            for tag in db.all_tags().await? {
                println!("{}", tag.name);
            }
        }
    }

    Ok(())
}

