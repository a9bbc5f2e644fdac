use async_trait::async_trait;
use flowbox_macros::FlowUnitDesc;
use std::str::FromStr;
use tracing::{debug, error};

use crate::buffers::Buffer;
use crate::core::{Configuration, DataContext, FlowError, FlowUnit, Result, StatusCode};

pub const IMAGE_INPUT: &str = "in_image";
pub const IMAGE_OUTPUT: &str = "out_image";

const RGB_CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    Nearest,
    #[default]
    Linear,
}

impl FromStr for Interpolation {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inter_nearest" => Ok(Self::Nearest),
            "inter_linear" => Ok(Self::Linear),
            other => Err(FlowError::bad_config(format!(
                "resize interpolation is invalid: {other}, valid methods are inter_nearest, inter_linear"
            ))),
        }
    }
}

/// Resizes packed 8-bit RGB/BGR images to a fixed size
#[derive(FlowUnitDesc, Debug, Default)]
#[flowunit(name = "resize", group = "Image", description = "resize packed rgb images")]
pub struct ResizeFlowUnit {
    #[input(name = "in_image")]
    _input: (),

    #[output(name = "out_image")]
    _output: (),

    #[option(name = "image_width", kind = "int", required = true, default = "640", description = "the resize width")]
    width: u32,

    #[option(name = "image_height", kind = "int", required = true, default = "480", description = "the resize height")]
    height: u32,

    #[option(kind = "string", default = "inter_linear", description = "the resize interpolation method")]
    interpolation: Interpolation,
}

impl ResizeFlowUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }
}

struct ImageInfo {
    width: usize,
    height: usize,
    pix_fmt: String,
}

fn packed_size(width: usize, height: usize) -> Result<usize> {
    width
        .checked_mul(height)
        .and_then(|pixels| pixels.checked_mul(RGB_CHANNELS))
        .ok_or_else(|| FlowError::invalid(format!("image size {width}x{height} overflows")))
}

fn image_info(buffer: &Buffer) -> Result<ImageInfo> {
    let height = buffer.get::<i32>("height").ok_or_else(|| {
        error!("meta don't have key height");
        FlowError::not_supported("meta don't have key height")
    })?;
    let width = buffer.get::<i32>("width").ok_or_else(|| {
        error!("meta don't have key width");
        FlowError::not_supported("meta don't have key width")
    })?;

    let pix_fmt = buffer.get::<String>("pix_fmt");
    if pix_fmt.is_none() && buffer.get::<i32>("channel").is_none() {
        error!("meta don't have key pix_fmt or channel");
        return Err(FlowError::not_supported("meta don't have key pix_fmt or channel"));
    }
    if let Some(channel) = buffer.get::<i32>("channel") {
        if channel != RGB_CHANNELS as i32 {
            error!(channel, "unsupported channel count");
            return Err(FlowError::not_supported(format!("unsupported channel count {channel}")));
        }
    }
    if let Some(fmt) = pix_fmt.as_deref() {
        if fmt != "rgb" && fmt != "bgr" {
            error!(pix_fmt = fmt, "unsupported pix format");
            return Err(FlowError::not_supported(format!("unsupported pix format {fmt}")));
        }
    }

    let (Ok(width), Ok(height)) = (usize::try_from(width), usize::try_from(height)) else {
        return Err(FlowError::invalid(format!("invalid image size {width}x{height}")));
    };
    if width == 0 || height == 0 {
        return Err(FlowError::invalid(format!("invalid image size {width}x{height}")));
    }

    let needed = packed_size(width, height)?;
    if buffer.bytes() < needed {
        return Err(FlowError::invalid(format!(
            "image of {width}x{height} needs {needed} bytes, buffer has {}",
            buffer.bytes()
        )));
    }

    Ok(ImageInfo {
        width,
        height,
        pix_fmt: pix_fmt.unwrap_or_default(),
    })
}

/// Resizes a packed 3-channel image from `src_w`x`src_h` into `dst`
pub fn resize_packed(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst: &mut [u8],
    dst_w: usize,
    dst_h: usize,
    interpolation: Interpolation,
) {
    let scale_x = src_w as f32 / dst_w as f32;
    let scale_y = src_h as f32 / dst_h as f32;
    let pixel = |x: usize, y: usize, c: usize| src[(y * src_w + x) * RGB_CHANNELS + c];

    for y in 0..dst_h {
        for x in 0..dst_w {
            let out = (y * dst_w + x) * RGB_CHANNELS;
            match interpolation {
                Interpolation::Nearest => {
                    let sx = ((x as f32 * scale_x) as usize).min(src_w - 1);
                    let sy = ((y as f32 * scale_y) as usize).min(src_h - 1);
                    for c in 0..RGB_CHANNELS {
                        dst[out + c] = pixel(sx, sy, c);
                    }
                }
                Interpolation::Linear => {
                    let fx = ((x as f32 + 0.5) * scale_x - 0.5).max(0.0);
                    let fy = ((y as f32 + 0.5) * scale_y - 0.5).max(0.0);
                    let x0 = (fx as usize).min(src_w - 1);
                    let y0 = (fy as usize).min(src_h - 1);
                    let x1 = (x0 + 1).min(src_w - 1);
                    let y1 = (y0 + 1).min(src_h - 1);
                    let wx = fx - x0 as f32;
                    let wy = fy - y0 as f32;

                    for c in 0..RGB_CHANNELS {
                        let top = pixel(x0, y0, c) as f32 * (1.0 - wx) + pixel(x1, y0, c) as f32 * wx;
                        let bottom = pixel(x0, y1, c) as f32 * (1.0 - wx) + pixel(x1, y1, c) as f32 * wx;
                        let value = top * (1.0 - wy) + bottom * wy;
                        dst[out + c] = value.round().clamp(0.0, 255.0) as u8;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl FlowUnit for ResizeFlowUnit {
    async fn open(&mut self, config: &Configuration) -> Result<()> {
        let mut width = config.get_u32("width", 0);
        if width == 0 {
            width = config.get_u32("image_width", 0);
        }
        let mut height = config.get_u32("height", 0);
        if height == 0 {
            height = config.get_u32("image_height", 0);
        }
        if width == 0 || height == 0 {
            error!("resize width or height is not configured or invalid");
            return Err(FlowError::bad_config(
                "resize width or height is not configured or invalid",
            ));
        }

        let interpolation = config.get_string("interpolation", "inter_linear");
        self.interpolation = interpolation.parse().inspect_err(|e| error!(error = %e, "bad interpolation"))?;
        self.width = width;
        self.height = height;

        debug!(width, height, interpolation, "resize opened");
        Ok(())
    }

    async fn process(&self, ctx: &mut DataContext) -> Result<StatusCode> {
        let inputs = ctx.input(IMAGE_INPUT).cloned().unwrap_or_default();
        if inputs.is_empty() {
            error!("input images batch is 0");
            return Err(FlowError::fault("input images batch is 0"));
        }

        let infos = inputs.iter().map(image_info).collect::<Result<Vec<_>>>()?;

        let (dst_w, dst_h) = (self.width as usize, self.height as usize);
        let sizes = vec![packed_size(dst_w, dst_h)?; inputs.len()];
        let outputs = ctx.output(IMAGE_OUTPUT);
        outputs.build(&sizes)?;

        for (i, info) in infos.into_iter().enumerate() {
            let src = inputs
                .const_buffer_data(i)
                .ok_or_else(|| FlowError::fault(format!("input {i} has no data")))?;
            let dst = outputs
                .mutable_buffer_data(i)
                .ok_or_else(|| FlowError::fault(format!("output {i} is not writable")))?;
            resize_packed(src, info.width, info.height, dst, dst_w, dst_h, self.interpolation);

            let Some(out) = outputs.at_mut(i) else {
                continue;
            };
            out.set("width", self.width as i32);
            out.set("height", self.height as i32);
            out.set("width_stride", self.width as i32);
            out.set("height_stride", self.height as i32);
            out.set("channel", RGB_CHANNELS as i32);
            out.set("pix_fmt", info.pix_fmt);
            out.set("type", "uint8".to_string());
            out.set("shape", vec![dst_h, dst_w, RGB_CHANNELS]);
            out.set("layout", "hwc".to_string());
        }

        Ok(StatusCode::Ok)
    }
}
