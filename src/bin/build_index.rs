use quiver::ingest::{self, IngestParams};
use quiver::kmeans::KmeansParams;
use quiver::matrix::AnyMatrix;
use quiver::{io, IndexType};

use std::path::Path;
use std::time::Instant;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Source vector file (.fvecs, .u8bin or .f32bin).
    #[clap(short, long, value_parser)]
    source: String,

    /// Directory the index group is created in.
    #[clap(short, long, value_parser)]
    index_uri: String,

    /// Index family: flat or ivf_flat.
    #[clap(short = 't', long, value_parser)]
    #[arg(default_value = "ivf_flat")]
    index_type: String,

    /// Partition count for ivf_flat. 0 derives sqrt(N).
    #[clap(short, long, value_parser)]
    #[arg(default_value_t = 0)]
    partitions: usize,

    /// Training vectors sampled for k-means. 0 derives 100 per partition.
    #[clap(long, value_parser)]
    #[arg(default_value_t = 0)]
    training_sample_size: usize,

    #[clap(long, value_parser)]
    #[arg(default_value_t = 10)]
    max_iter: usize,

    /// Shard width of the shuffle-write step.
    #[clap(long, value_parser)]
    #[arg(default_value_t = 100_000)]
    vectors_per_work_item: usize,
}

pub fn main() {
    env_logger::init();
    let args = Args::parse();

    let source = Path::new(&args.source);
    let vectors = match source.extension().and_then(|e| e.to_str()) {
        Some("fvecs") => AnyMatrix::F32(io::read_fvecs(source).unwrap()),
        Some("u8bin") => AnyMatrix::U8(io::read_u8bin(source).unwrap()),
        Some("f32bin") => AnyMatrix::F32(io::read_f32bin(source).unwrap()),
        other => panic!("unsupported source format {other:?}"),
    };

    println!("Number of Vectors: {}", vectors.ncols());
    println!("Number of Dimensions: {}", vectors.nrows());

    let index_type = match args.index_type.as_str() {
        "flat" => IndexType::Flat,
        "ivf_flat" => IndexType::IvfFlat,
        other => panic!("unsupported index type {other:?}"),
    };

    let params = IngestParams {
        index_type,
        partitions: args.partitions,
        training_sample_size: args.training_sample_size,
        kmeans: KmeansParams {
            max_iter: args.max_iter,
            ..KmeansParams::default()
        },
        vectors_per_work_item: args.vectors_per_work_item,
        index_timestamp: None,
    };

    println!("\nBuilding the index...");
    println!("{params:?}");
    let time = Instant::now();

    ingest::ingest(Path::new(&args.index_uri), &vectors, None, &params).unwrap();

    let elapsed = time.elapsed();
    println!("Time to build {} secs", elapsed.as_secs());
    println!("Index group at {}", args.index_uri);
}
