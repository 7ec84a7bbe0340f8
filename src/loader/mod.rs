//! Reference stages for every asset kind, and the canonical task graphs
//! built from them.
//!
//! The engine itself never depends on anything in here; the command line
//! tool uses [`canonical`] to get a working setup for the usual source layout:
//!
//! | source                | task        | output            |
//! |-----------------------|-------------|-------------------|
//! | `**/*.html`           | `markup`    | `/`               |
//! | `scss/**/*.scss`      | `styles`    | `css/`            |
//! | `js/main.js`          | `scripts`   | `js/`             |
//! | `images/*.{jpg,png}`  | `images`    | `images/`         |
//! | `images/svg/*.svg`    | `sprite`    | `images/sprite.svg` |
//! | `fonts/*.ttf`         | `fonts`     | `fonts/`          |
//! | `resources/**/*`      | `resources` | `/`               |

pub mod fonts;
pub mod markup;
pub mod scripts;
pub mod sprite;
#[cfg(feature = "grass")]
pub mod styles;

pub mod images;

#[cfg(feature = "live")]
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::blueprint::Blueprint;
#[cfg(feature = "live")]
use crate::blueprint::Website;
#[cfg(feature = "live")]
use crate::engine::ErrorSink;
#[cfg(feature = "live")]
use crate::engine::runner::watch::Watcher;
use crate::core::{Environment, Mode};
use crate::engine::{Category, Handle};
use crate::error::{ConfigError, StageError};
use crate::output::Clean;
use crate::pipeline::sourcemap::SourceMaps;
use crate::pipeline::{FileRecord, Pipeline, Stage};

/// External programs used by some stages.
#[derive(Debug, Clone)]
pub struct Toolchain {
    /// Command turning `font.ttf` into `font.woff2` next to it.
    pub woff2: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            woff2: String::from("woff2_compress"),
        }
    }
}

/// Globs of the development loop, each with the task it triggers.
pub const BINDINGS: &[(&str, &str)] = &[
    ("scss/**/*.scss", "styles"),
    ("**/*.html", "markup"),
    ("js/**/*.js", "scripts"),
    ("images/*.jpg", "images"),
    ("images/*.jpeg", "images"),
    ("images/*.png", "images"),
    ("images/*.svg", "images"),
    ("images/svg/*.svg", "sprite"),
    ("fonts/*.ttf", "fonts"),
    ("resources/**/*", "resources"),
];

#[cfg(feature = "image")]
const RASTER: &[&str] = &["images/*.jpg", "images/*.jpeg", "images/*.png"];

/// Registers every task for `env.mode` and returns the root.
///
/// A production build is
/// `sequential(clean, parallel(markup, scripts, fonts, images, sprite, resources), styles, compress)`,
/// the development loop drops `compress`, keeps styles expanded and adds
/// source maps and the reload client.
pub fn canonical(
    blueprint: &mut Blueprint,
    env: &Environment,
    tools: &Toolchain,
) -> Result<Handle, ConfigError> {
    let dev = env.mode == Mode::Watch;

    let clean = blueprint.register("clean", Clean)?;

    let assets = [
        blueprint.register("markup", markup_pipeline(env)?)?,
        blueprint.register("scripts", scripts_pipeline(dev)?)?,
        blueprint.register("fonts", fonts_pipeline(tools)?)?,
        blueprint.register("images", images_pipeline()?)?,
        blueprint.register("sprite", sprite_pipeline()?)?,
        blueprint.register("resources", resources_pipeline()?)?,
    ];
    let assets = blueprint.parallel("assets", assets)?;

    let mut steps = vec![clean, assets];

    #[cfg(feature = "grass")]
    steps.push(blueprint.register("styles", styles_pipeline(dev)?)?);

    #[cfg(feature = "image")]
    if !dev {
        steps.push(blueprint.register("compress", compress_pipeline()?)?);
    }

    let root = if dev { "dev" } else { "build" };
    blueprint.sequential(root, steps)
}

/// Binds every entry of [`BINDINGS`] whose task is registered in `site`.
///
/// The bound tasks are checked for overlapping outputs here, so a dev
/// session refuses to start before the initial build writes anything.
#[cfg(feature = "live")]
pub fn watcher(site: Arc<Website>, sink: ErrorSink) -> Result<Watcher, ConfigError> {
    let mut watcher = Watcher::new(site.clone(), sink);

    for (glob, task) in BINDINGS {
        if site.lookup(task).is_some() {
            watcher.bind(glob, task)?;
        }
    }

    watcher.validate()?;
    Ok(watcher)
}

fn markup_pipeline(env: &Environment) -> Result<Pipeline, ConfigError> {
    let mut pipeline = Pipeline::new(&["**/*.html"])?
        .category(Category::Markup)
        .then(markup::Include);

    if env.mode == Mode::Watch
        && let Some(port) = env.reload_port
    {
        pipeline = pipeline.then(markup::LiveReload::new(port));
    }

    Ok(pipeline)
}

#[cfg(feature = "grass")]
fn styles_pipeline(dev: bool) -> Result<Pipeline, ConfigError> {
    let pipeline = Pipeline::new(&["scss/**/*.scss"])?
        .exclude("**/_*.scss")?
        .dest("css")
        .category(Category::Styles);

    Ok(if dev {
        pipeline.then(styles::Sass::expanded()).then(SourceMaps)
    } else {
        pipeline.then(styles::Sass::compressed()).then(Suffix::new(".min"))
    })
}

fn scripts_pipeline(dev: bool) -> Result<Pipeline, ConfigError> {
    let pipeline = Pipeline::new(&["js/main.js"])?
        .dest("js")
        .category(Category::Scripts);

    Ok(if dev {
        pipeline.then(scripts::IdentityMap).then(SourceMaps)
    } else {
        pipeline
    })
}

fn fonts_pipeline(tools: &Toolchain) -> Result<Pipeline, ConfigError> {
    Ok(Pipeline::new(&["fonts/*.ttf"])?
        .dest("fonts")
        .then(fonts::Woff)
        .then(fonts::Woff2::new(&tools.woff2)))
}

fn images_pipeline() -> Result<Pipeline, ConfigError> {
    let globs = ["images/*.jpg", "images/*.jpeg", "images/*.png", "images/*.svg"];
    Ok(Pipeline::new(&globs)?.dest("images"))
}

#[cfg(feature = "image")]
fn compress_pipeline() -> Result<Pipeline, ConfigError> {
    Ok(Pipeline::new(RASTER)?.dest("images").then(images::Compress::default()))
}

fn sprite_pipeline() -> Result<Pipeline, ConfigError> {
    Ok(Pipeline::new(&["images/svg/*.svg"])?
        .dest("images")
        .then(sprite::SvgIcon)
        .gather(sprite::Sprite::new("images/sprite.svg")))
}

fn resources_pipeline() -> Result<Pipeline, ConfigError> {
    Pipeline::new(&["resources/**/*"])
}

/// Inserts a suffix before the extension: `main.css` becomes `main.min.css`.
#[derive(Debug, Clone)]
pub struct Suffix(String);

impl Suffix {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self(suffix.into())
    }

    fn apply(&self, dest: &mut Utf8PathBuf) {
        let name = match (dest.file_stem(), dest.extension()) {
            (Some(stem), Some(ext)) => format!("{stem}{}.{ext}", self.0),
            (Some(stem), None) => format!("{stem}{}", self.0),
            _ => return,
        };
        dest.set_file_name(name);
    }
}

impl Stage for Suffix {
    fn name(&self) -> &str {
        "suffix"
    }

    fn plan(&self, mut dest: Utf8PathBuf) -> Vec<Utf8PathBuf> {
        self.apply(&mut dest);
        vec![dest]
    }

    fn transform(&self, mut record: FileRecord) -> Result<Vec<FileRecord>, StageError> {
        self.apply(&mut record.dest);
        Ok(vec![record])
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::*;
    use crate::blueprint::Website;
    use crate::engine::Runnable;

    fn graph(mode: Mode) -> (Website, Handle) {
        let mut env = Environment::new(mode, "does-not-exist/src", "does-not-exist/app");
        env.reload_port = Some(1337);

        let mut blueprint = Blueprint::new();
        let root = canonical(&mut blueprint, &env, &Toolchain::default()).unwrap();
        (blueprint.finish(env).unwrap(), root)
    }

    #[test]
    fn test_production_layout() {
        let (site, root) = graph(Mode::Build);
        assert_eq!(site.name(root), "build");

        let children: Vec<_> = crate::blueprint::children(&site.graph, root.0)
            .into_iter()
            .map(|index| site.graph[index].name().to_owned())
            .collect();

        let mut expected = vec!["clean", "assets"];
        if cfg!(feature = "grass") {
            expected.push("styles");
        }
        if cfg!(feature = "image") {
            expected.push("compress");
        }
        assert_eq!(children, expected);
    }

    #[test]
    fn test_development_has_no_compress() {
        let (site, root) = graph(Mode::Watch);
        assert_eq!(site.name(root), "dev");
        assert!(site.lookup("compress").is_none());
    }

    #[test]
    fn test_bindings_name_registered_tasks() {
        let (site, _) = graph(Mode::Watch);
        for (_, task) in BINDINGS {
            if *task == "styles" && cfg!(not(feature = "grass")) {
                continue;
            }
            assert!(site.lookup(task).is_some(), "{task} is not registered");
        }
    }

    #[test]
    fn test_resources_are_copied_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let src = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::create_dir_all(src.join("resources/meta")).unwrap();
        std::fs::write(src.join("resources/robots.txt"), "User-agent: *").unwrap();
        std::fs::write(src.join("resources/meta/site.webmanifest"), "{}").unwrap();

        let env = Environment::new(Mode::Build, src, src.join("app"));
        let mut planned = resources_pipeline().unwrap().plan(&env).unwrap();
        planned.sort();

        assert_eq!(
            planned,
            vec![Utf8PathBuf::from("meta/site.webmanifest"), Utf8PathBuf::from("robots.txt")]
        );
    }

    #[test]
    fn test_suffix() {
        let mut dest = Utf8PathBuf::from("css/main.css");
        Suffix::new(".min").apply(&mut dest);
        assert_eq!(dest, "css/main.min.css");
    }
}
