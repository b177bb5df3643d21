/*!
 * DXGI swap-chain discovery and present trampoline
 *
 * D3D11 swap chains created against the same device type share one
 * vtable, so patching the `Present` entry (index 8) of a throwaway probe
 * swap chain intercepts every swap chain in the process.
 */

use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use windows::core::{Interface, HRESULT};
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDeviceAndSwapChain, ID3D11Device, ID3D11DeviceContext, D3D11_CREATE_DEVICE_FLAG,
    D3D11_SDK_VERSION,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_MODE_DESC, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{
    IDXGISwapChain, DXGI_SWAP_CHAIN_DESC, DXGI_SWAP_EFFECT_DISCARD,
    DXGI_USAGE_RENDER_TARGET_OUTPUT,
};
use windows::Win32::UI::WindowsAndMessaging::GetDesktopWindow;

use crate::extract::SurfaceHandle;
use crate::hook::{HookError, InterceptHandle, InterceptTarget, PresentHook};

/// `IDXGISwapChain::Present` sits at index 8: 3 `IUnknown` entries, 4
/// `IDXGIObject`, 1 `IDXGIDeviceSubObject`.
pub const PRESENT_VTABLE_INDEX: usize = 8;

type PresentFn = unsafe extern "system" fn(*mut c_void, u32, u32) -> HRESULT;

static ACTIVE_HOOK: Mutex<Option<Arc<PresentHook>>> = Mutex::new(None);
static ORIGINAL_PRESENT: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());

/// Throwaway device + swap chain used only to reach the shared vtable.
/// Kept alive by the engine so the extractor can reuse the device.
pub struct ProbeSwapChain {
    pub device: ID3D11Device,
    pub context: ID3D11DeviceContext,
    pub swap_chain: IDXGISwapChain,
}

impl ProbeSwapChain {
    pub fn swap_chain_ptr(&self) -> *mut c_void {
        self.swap_chain.as_raw()
    }
}

/// Create a minimal hidden swap chain against the desktop window.
pub fn create_probe_swap_chain() -> Result<ProbeSwapChain, HookError> {
    let hwnd: HWND = unsafe { GetDesktopWindow() };
    if hwnd.0 == 0 {
        return Err(HookError::NoSurface);
    }

    let desc = DXGI_SWAP_CHAIN_DESC {
        BufferDesc: DXGI_MODE_DESC {
            Width: 2,
            Height: 2,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            ..Default::default()
        },
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
        BufferCount: 1,
        OutputWindow: hwnd,
        Windowed: true.into(),
        SwapEffect: DXGI_SWAP_EFFECT_DISCARD,
        ..Default::default()
    };

    let mut swap_chain = None;
    let mut device = None;
    let mut context = None;
    unsafe {
        D3D11CreateDeviceAndSwapChain(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            None,
            D3D11_CREATE_DEVICE_FLAG(0),
            None,
            D3D11_SDK_VERSION,
            Some(&desc as *const _),
            Some(&mut swap_chain as *mut _),
            Some(&mut device as *mut _),
            None,
            Some(&mut context as *mut _),
        )
    }
    .map_err(|_| HookError::NoSurface)?;

    match (swap_chain, device, context) {
        (Some(swap_chain), Some(device), Some(context)) => Ok(ProbeSwapChain {
            device,
            context,
            swap_chain,
        }),
        _ => Err(HookError::NoSurface),
    }
}

/// Patch the `Present` entry of the given swap chain's vtable with the
/// trampoline and arm the process-wide hook state.
pub fn install_on_swap_chain(
    hook: &Arc<PresentHook>,
    swap_chain: *mut c_void,
) -> Result<InterceptHandle, HookError> {
    if swap_chain.is_null() {
        return Err(HookError::NoSurface);
    }
    // COM object layout: the first word points at the vtable.
    let table = unsafe { *(swap_chain as *mut *mut *const c_void) };
    let handle = hook.interceptor().install(InterceptTarget {
        table,
        index: PRESENT_VTABLE_INDEX,
        replacement: present_trampoline as *const c_void,
    })?;
    ORIGINAL_PRESENT.store(handle.original() as *mut c_void, Ordering::Release);
    *ACTIVE_HOOK.lock().unwrap() = Some(Arc::clone(hook));
    Ok(handle)
}

/// Disarm the process-wide hook state. `restored` is false when the
/// patched entry could not be put back; a third-party patch may then
/// still chain into our trampoline, which must keep forwarding to the
/// original, so `ORIGINAL_PRESENT` stays populated in that case.
pub fn clear_active_hook(restored: bool) {
    *ACTIVE_HOOK.lock().unwrap() = None;
    if restored {
        ORIGINAL_PRESENT.store(std::ptr::null_mut(), Ordering::Release);
    }
}

/// The patched `Present`. Calls the original first, then hands the
/// surface to the hook; always returns the original's result.
unsafe extern "system" fn present_trampoline(
    this: *mut c_void,
    sync_interval: u32,
    flags: u32,
) -> HRESULT {
    let original = ORIGINAL_PRESENT.load(Ordering::Acquire);
    let result = if original.is_null() {
        HRESULT(0)
    } else {
        let original: PresentFn = std::mem::transmute(original);
        original(this, sync_interval, flags)
    };

    let hook = ACTIVE_HOOK.lock().unwrap().clone();
    if let Some(hook) = hook {
        hook.invoke_present_callback(&SurfaceHandle(this));
    }
    result
}
