/*!
 * D3D11 staging-texture readback
 *
 * Production [`SurfaceReader`]: copy the swap chain's back buffer into a
 * CPU-readable staging texture, map it, and copy the rows out. The
 * staging texture is cached and only recreated when the back buffer's
 * size or format changes.
 */

use std::sync::Arc;

use windows::core::Interface;
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D, D3D11_CPU_ACCESS_READ,
    D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::IDXGISwapChain;

use crate::diagnostics::{Diagnostics, ErrorCategory};
use crate::extract::{ExtractError, SurfaceDesc, SurfaceHandle, SurfaceReader};

/// Staging-texture reader over borrowed device/context handles. The
/// handles are cloned COM references; the owning application keeps the
/// device alive for the duration of the capture session.
pub struct D3d11SurfaceReader {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    staging: Option<(ID3D11Texture2D, SurfaceDesc)>,
    diag: Arc<Diagnostics>,
}

impl D3d11SurfaceReader {
    pub fn new(device: ID3D11Device, context: ID3D11DeviceContext, diag: Arc<Diagnostics>) -> Self {
        Self {
            device,
            context,
            staging: None,
            diag,
        }
    }

    /// Build a reader from the device behind a live swap chain, as seen
    /// at present time.
    pub fn from_swap_chain(
        surface: &SurfaceHandle,
        diag: Arc<Diagnostics>,
    ) -> Result<Self, ExtractError> {
        let swap_chain = unsafe { IDXGISwapChain::from_raw_borrowed(&surface.0) }
            .ok_or(ExtractError::NotInitialized)?;
        let device = unsafe { swap_chain.GetDevice::<ID3D11Device>() }
            .map_err(|e| ExtractError::Describe(format!("GetDevice failed: {e}")))?;
        let mut context = None;
        unsafe { device.GetImmediateContext(&mut context) };
        let context = context
            .ok_or_else(|| ExtractError::Describe("device has no immediate context".to_string()))?;
        Ok(Self::new(device, context, diag))
    }

    fn back_buffer(surface: &SurfaceHandle) -> Result<ID3D11Texture2D, ExtractError> {
        let swap_chain = unsafe { IDXGISwapChain::from_raw_borrowed(&surface.0) }
            .ok_or(ExtractError::NotInitialized)?;
        unsafe { swap_chain.GetBuffer::<ID3D11Texture2D>(0) }
            .map_err(|e| ExtractError::Describe(format!("GetBuffer failed: {e}")))
    }

    fn texture_desc(texture: &ID3D11Texture2D) -> SurfaceDesc {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        SurfaceDesc {
            width: desc.Width,
            height: desc.Height,
            format: desc.Format.0 as u32,
        }
    }

    /// Return a staging texture matching `desc`, recreating the cached
    /// one only when size or format changed.
    fn staging_for(&mut self, desc: SurfaceDesc) -> Result<ID3D11Texture2D, ExtractError> {
        if let Some((texture, cached)) = &self.staging {
            if *cached == desc {
                return Ok(texture.clone());
            }
            self.diag.errors.debug(
                ErrorCategory::Graphics,
                "D3d11SurfaceReader",
                format!(
                    "surface changed to {}x{} format {}, recreating staging texture",
                    desc.width, desc.height, desc.format
                ),
            );
        }

        let texture_desc = D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT(desc.format as i32),
            SampleDesc: windows::Win32::Graphics::Dxgi::Common::DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: Default::default(),
            CPUAccessFlags: D3D11_CPU_ACCESS_READ,
            MiscFlags: Default::default(),
        };
        let mut texture = None;
        unsafe {
            self.device
                .CreateTexture2D(&texture_desc, None, Some(&mut texture as *mut _))
        }
        .map_err(|e| ExtractError::Readback(format!("CreateTexture2D failed: {e}")))?;
        let texture = texture.ok_or_else(|| {
            ExtractError::Readback("CreateTexture2D returned no texture".to_string())
        })?;
        self.staging = Some((texture.clone(), desc));
        Ok(texture)
    }
}

impl SurfaceReader for D3d11SurfaceReader {
    fn describe(&mut self, surface: &SurfaceHandle) -> Result<SurfaceDesc, ExtractError> {
        Ok(Self::texture_desc(&Self::back_buffer(surface)?))
    }

    fn read_into(
        &mut self,
        surface: &SurfaceHandle,
        out: &mut Vec<u8>,
    ) -> Result<u32, ExtractError> {
        let back_buffer = Self::back_buffer(surface)?;
        let desc = Self::texture_desc(&back_buffer);
        let staging = self.staging_for(desc)?;

        unsafe { self.context.CopyResource(&staging, &back_buffer) };

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.context
                .Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped as *mut _))
        }
        .map_err(|e| ExtractError::Readback(format!("Map failed: {e}")))?;

        let stride = mapped.RowPitch;
        let len = stride as usize * desc.height as usize;
        out.clear();
        out.reserve(len);
        unsafe {
            out.extend_from_slice(std::slice::from_raw_parts(mapped.pData as *const u8, len));
            self.context.Unmap(&staging, 0);
        }
        Ok(stride)
    }
}
