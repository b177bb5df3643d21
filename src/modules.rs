/*!
 * Loaded-module scanning
 *
 * Locates the graphics runtime inside the current process: DXGI/D3D11 on
 * Windows, the GL/Vulkan/EGL sonames from `/proc/self/maps` elsewhere.
 * Finding none is a normal outcome for processes that have not brought
 * a renderer up yet.
 */

use tracing::debug;

/// A graphics runtime module found in this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsRuntime {
    /// Module name as matched (e.g. `d3d11.dll`, `libGL.so.1`).
    pub module: String,
    /// Full path when the platform reports one.
    pub path: Option<String>,
}

#[cfg(windows)]
const RUNTIME_MODULES: &[&str] = &["dxgi.dll", "d3d11.dll"];

#[cfg(not(windows))]
const RUNTIME_MODULES: &[&str] = &["libGL.so", "libGLX.so", "libEGL.so", "libvulkan.so"];

/// Scan the process for a loaded graphics runtime.
#[cfg(windows)]
pub fn find_graphics_runtime() -> Option<GraphicsRuntime> {
    use windows::core::HSTRING;
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;

    for module in RUNTIME_MODULES {
        if unsafe { GetModuleHandleW(&HSTRING::from(*module)) }.is_ok() {
            debug!(module, "graphics runtime located");
            return Some(GraphicsRuntime {
                module: module.to_string(),
                path: None,
            });
        }
    }
    None
}

/// Scan the process for a loaded graphics runtime.
#[cfg(not(windows))]
pub fn find_graphics_runtime() -> Option<GraphicsRuntime> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    let found = first_runtime_in_maps(&maps);
    if let Some(runtime) = &found {
        debug!(module = %runtime.module, "graphics runtime located");
    }
    found
}

#[cfg(not(windows))]
fn first_runtime_in_maps(maps: &str) -> Option<GraphicsRuntime> {
    for line in maps.lines() {
        // Mapping lines end with the backing path when there is one.
        let Some(path) = line.split_whitespace().nth(5) else {
            continue;
        };
        let file_name = path.rsplit('/').next().unwrap_or(path);
        for module in RUNTIME_MODULES {
            if file_name.starts_with(module) {
                return Some(GraphicsRuntime {
                    module: file_name.to_string(),
                    path: Some(path.to_string()),
                });
            }
        }
    }
    None
}
