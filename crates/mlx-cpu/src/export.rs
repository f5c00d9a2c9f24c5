//! Exported functions.
//!
//! An export file is JSON: a header plus one traced graph per recorded
//! call signature. Each trace remembers which of its trailing inputs were
//! passed by name, so an imported function can match keyword arguments
//! back to the trace that expects them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mlx_engine::{Array, EngineError, EngineResult, ExportSession, HostFn, NativeKwFn};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{tensor_of, CpuEngine, Shared};
use crate::graph::Graph;

const FORMAT: &str = "mlx-cpu-graph";
const VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct ExportFile {
    pub format: String,
    pub version: u32,
    pub shapeless: bool,
    pub traces: Vec<ExportedTrace>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExportedTrace {
    /// Names of the trailing keyword inputs, in input order
    pub kwarg_names: Vec<String>,
    pub graph: Arc<Graph>,
}

impl ExportFile {
    fn new(shapeless: bool) -> Self {
        ExportFile {
            format: FORMAT.into(),
            version: VERSION,
            shapeless,
            traces: Vec::new(),
        }
    }

    fn write(&self, path: &Path) -> EngineResult<()> {
        let json = serde_json::to_vec(self).map_err(|e| EngineError::io("export_function", e))?;
        fs::write(path, json).map_err(|e| EngineError::io("export_function", e))
    }

    fn read(path: &Path) -> EngineResult<Self> {
        let bytes = fs::read(path).map_err(|e| EngineError::io("import_function", e))?;
        let file: ExportFile =
            serde_json::from_slice(&bytes).map_err(|e| EngineError::io("import_function", e))?;
        if file.format != FORMAT || file.version != VERSION {
            return Err(EngineError::io(
                "import_function",
                format!("unsupported export format {} version {}", file.format, file.version),
            ));
        }
        Ok(file)
    }
}

/// Export session that rewrites its file after every recorded trace
#[derive(Debug)]
pub struct CpuExporter {
    engine: CpuEngine,
    path: PathBuf,
    file: ExportFile,
    closed: bool,
}

impl CpuExporter {
    pub fn new(engine: CpuEngine, path: &Path, shapeless: bool) -> Self {
        debug!(path = %path.display(), shapeless, "opened exporter");
        CpuExporter {
            engine,
            path: path.to_path_buf(),
            file: ExportFile::new(shapeless),
            closed: false,
        }
    }
}

impl ExportSession for CpuExporter {
    fn record(&mut self, f: &mut HostFn<'_>, args: &[Array], kwarg_names: &[String]) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::invalid("exporter", "exporter is closed"));
        }
        if kwarg_names.len() > args.len() {
            return Err(EngineError::invalid(
                "exporter",
                format!("{} keyword names for {} arguments", kwarg_names.len(), args.len()),
            ));
        }
        let graph = self.engine.shared().trace(f, args)?;
        self.file.traces.push(ExportedTrace {
            kwarg_names: kwarg_names.to_vec(),
            graph: Arc::new(graph),
        });
        self.file.write(&self.path)
    }

    fn close(&mut self) -> EngineResult<()> {
        if !self.closed {
            self.closed = true;
            debug!(path = %self.path.display(), traces = self.file.traces.len(), "closed exporter");
            self.file.write(&self.path)?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Load an export file as a callable taking positional and keyword arrays
pub(crate) fn import(shared: Arc<Shared>, path: &Path) -> EngineResult<NativeKwFn> {
    let file = ExportFile::read(path)?;
    debug!(path = %path.display(), traces = file.traces.len(), "imported function");
    let shapeless = file.shapeless;
    let traces = file.traces;
    Ok(Arc::new(move |args: &[Array], kwargs: &[(String, Array)]| {
        for trace in &traces {
            if trace.kwarg_names.len() != kwargs.len() || trace.graph.inputs.len() != args.len() + kwargs.len() {
                continue;
            }
            let mut inputs = args.to_vec();
            for name in &trace.kwarg_names {
                if let Some((_, a)) = kwargs.iter().find(|(k, _)| k == name) {
                    inputs.push(a.clone());
                }
            }
            if inputs.len() != trace.graph.inputs.len() {
                continue;
            }
            let tensors = inputs.iter().map(tensor_of).collect::<EngineResult<Vec<_>>>()?;
            if trace.graph.check_inputs(&tensors, shapeless).is_ok() {
                return shared.call(&trace.graph, &inputs, shapeless);
            }
        }
        Err(EngineError::invalid(
            "import_function",
            "no traced function matches the given inputs",
        ))
    }))
}
