use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use clap::Parser;
use color_eyre as ey;
use ey::eyre::{eyre, Context};
use strom::{Model, ResourceKind, Streamer, Texture};
use strom_content::{
    extract_extension_from_path,
    model::{ModelData, MODEL_FILE_TYPE},
    resource_file::{read_resource_file, write_resource_file, ResourceRead},
    texture::{TextureData, TEXTURE_FILE_TYPE},
    Directories, MaterializerRegistry, Origin,
};
use strom_shared::{
    format_bytes,
    log::{self, info},
    spin_sleep, StreamingConfig,
};
use strom_transfer::HostDevice;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
enum CommandLineArguments {
    Materialize(Materialize),
    Inspect(Inspect),
    Stream(Stream),
}

/// Converts a source file into a canonical resource file
#[derive(Parser, Debug)]
struct Materialize {
    /// Source file. The extension selects the materializer.
    #[arg(short, long)]
    source_filepath: PathBuf,

    /// Destination file
    #[arg(short, long)]
    destination_filepath: PathBuf,
}

/// Prints the header and a summary of a canonical resource file
#[derive(Parser, Debug)]
struct Inspect {
    filepath: PathBuf,
}

/// Streams source files into an in-memory device and reports the progress
#[derive(Parser, Debug)]
struct Stream {
    /// Source files
    #[arg(required = true)]
    source_filepaths: Vec<PathBuf>,

    /// Directory for the canonical files and the index files
    #[arg(short, long, default_value = "processed")]
    processed_directory: PathBuf,

    /// YAML file with the streaming configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the number of I/O threads of the configuration
    #[arg(long)]
    io_worker_count: Option<usize>,

    /// Overrides the staging capacity in bytes of the configuration
    #[arg(long)]
    staging_capacity: Option<u64>,

    /// Restore the index of a previous session before adding the source files
    #[arg(long)]
    load_index: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Model,
    Texture,
}

/// Returns the kind whose default materializers handle the extension of the path.
fn kind_of(path: &Path) -> ey::Result<Kind> {
    let extension = extract_extension_from_path(path).wrap_err("Failed to determine the extension")?;
    let mut models = MaterializerRegistry::default();
    Model::register_default_materializers(&mut models);
    let mut textures = MaterializerRegistry::default();
    Texture::register_default_materializers(&mut textures);
    if models.contains(&extension) {
        Ok(Kind::Model)
    } else if textures.contains(&extension) {
        Ok(Kind::Texture)
    } else {
        Err(eyre!("No materializer is registered for the extension '{extension}'"))
    }
}

fn materialize(materialize: &Materialize) -> ey::Result<()> {
    let origin = Origin::from_path(&materialize.source_filepath);
    let name = materialize
        .source_filepath
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    match kind_of(&materialize.source_filepath)? {
        Kind::Model => {
            let mut materializers = MaterializerRegistry::default();
            Model::register_default_materializers(&mut materializers);
            info!("Materializing model: {:?}", materialize.source_filepath);
            let model = materializers.materialize(&name, &origin).wrap_err("Failed to materialize the model")?;
            write_resource_file(&materialize.destination_filepath, MODEL_FILE_TYPE, &model)
                .wrap_err("Failed to write the model file")?;
        }
        Kind::Texture => {
            let mut materializers = MaterializerRegistry::default();
            Texture::register_default_materializers(&mut materializers);
            info!("Materializing texture: {:?}", materialize.source_filepath);
            let texture = materializers
                .materialize(&name, &origin)
                .wrap_err("Failed to materialize the texture")?;
            write_resource_file(&materialize.destination_filepath, TEXTURE_FILE_TYPE, &texture)
                .wrap_err("Failed to write the texture file")?;
        }
    }
    info!("Written {:?}", materialize.destination_filepath);
    Ok(())
}

fn inspect(inspect: &Inspect) -> ey::Result<()> {
    let file = File::open(&inspect.filepath).wrap_err("Failed to open the resource file")?;
    let resource_read = ResourceRead::open(BufReader::new(file)).wrap_err("Failed to read the header")?;
    let header = resource_read.header().clone();
    println!("version:   {}", header.version);
    println!("file type: {}", header.file_type);
    match header.file_type.as_str() {
        MODEL_FILE_TYPE => {
            let model: ModelData = read_resource_file(&inspect.filepath, MODEL_FILE_TYPE).wrap_err("Failed to read the model")?;
            println!("name:      {}", model.name);
            println!("meshes:    {}", model.meshes.len());
            for (index, range) in model.mesh_ranges().iter().enumerate() {
                println!("  mesh {index}: {} vertices, {} indices", range.vertex_count, range.index_count);
            }
            println!("device:    {}", format_bytes(model.device_size()));
        }
        TEXTURE_FILE_TYPE => {
            let texture: TextureData =
                read_resource_file(&inspect.filepath, TEXTURE_FILE_TYPE).wrap_err("Failed to read the texture")?;
            println!("name:      {}", texture.name);
            println!("extent:    {}x{} with {} layers", texture.width, texture.height, texture.layers);
            println!("format:    {:?}", texture.format);
            println!("device:    {}", format_bytes(texture.data.len() as u64));
        }
        file_type => return Err(eyre!("Unknown file type '{file_type}'")),
    }
    Ok(())
}

fn stream(stream: &Stream) -> ey::Result<()> {
    let mut config = match &stream.config {
        Some(path) => StreamingConfig::from_yaml_file(path).wrap_err("Failed to read the configuration")?,
        None => StreamingConfig::default(),
    };
    if let Some(io_worker_count) = stream.io_worker_count {
        config.io_worker_count = io_worker_count;
    }
    if let Some(staging_capacity) = stream.staging_capacity {
        config.staging_capacity = staging_capacity;
    }

    let directories =
        Directories::create_all_dir(&stream.processed_directory).wrap_err("Failed to create the processed directory")?;
    let device = Arc::new(HostDevice::new());
    let streamer = Streamer::new(device.clone(), directories, config).wrap_err("Failed to start the streamer")?;
    if stream.load_index {
        let restored = streamer.load_index().wrap_err("Failed to load the index")?;
        info!("Restored {restored} resources");
    }

    let mut models = Vec::new();
    let mut textures = Vec::new();
    for path in &stream.source_filepaths {
        let name = path.to_string_lossy().into_owned();
        let origin = Origin::from_path(path);
        match kind_of(path)? {
            Kind::Model => {
                let handle = streamer.models().add(origin, name).wrap_err("Failed to add the model")?;
                streamer.models().acquire(handle);
                models.push(handle);
            }
            Kind::Texture => {
                let handle = streamer.textures().add(origin, name).wrap_err("Failed to add the texture")?;
                streamer.textures().acquire(handle);
                textures.push(handle);
            }
        }
    }

    let start = Instant::now();
    let mut frames = 0;
    while !streamer.is_idle() {
        let report = streamer.update().wrap_err("Failed to update the streamer")?;
        if let Some(capacity) = report.models.capacity_changed {
            info!("Model capacity changed to {capacity}");
        }
        if let Some(capacity) = report.textures.capacity_changed {
            info!("Texture capacity changed to {capacity}");
        }
        frames += 1;
        spin_sleep::sleep(Duration::from_millis(1));
    }
    streamer.update().wrap_err("Failed to update the streamer")?;
    info!("Streaming finished after {frames} frames in {:?}", start.elapsed());

    for handle in models {
        let name = streamer.models().name(handle)?;
        let state = streamer.models().is_loaded(handle)?;
        let failure = streamer.models().failure(handle)?.unwrap_or_default();
        println!("model   {name}: {state:?} {failure}");
    }
    for handle in textures {
        let name = streamer.textures().name(handle)?;
        let state = streamer.textures().is_loaded(handle)?;
        let failure = streamer.textures().failure(handle)?.unwrap_or_default();
        println!("texture {name}: {state:?} {failure}");
    }
    println!("submissions: {}", streamer.engine().submission_count());
    println!("objects:     {}", device.object_count());

    streamer.save_index().wrap_err("Failed to save the index")?;
    streamer.shutdown().wrap_err("Failed to shut down the streamer")?;
    Ok(())
}

fn main() -> ey::Result<()> {
    color_eyre::install()?;

    // Setup logging
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                strom_shared::chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(io::stdout())
        .apply()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    match &CommandLineArguments::parse() {
        CommandLineArguments::Materialize(arguments) => materialize(arguments),
        CommandLineArguments::Inspect(arguments) => inspect(arguments),
        CommandLineArguments::Stream(arguments) => stream(arguments),
    }
}
