//! GLSL compilation and pipeline construction.
//!
//! The trace program is rebuilt whenever its on-disk sources change, so the
//! build is wrapped in a wgpu validation error scope: a bad edit surfaces as
//! an `Err` with the naga diagnostic and the caller keeps the previous
//! pipeline bound. The display program is baked in and built once.

use std::borrow::Cow;

use anyhow::{bail, Result};
use wgpu::naga::ShaderStage;

/// Offscreen accumulation target format. 32-bit float keeps thousands of
/// additive samples exact; blending on it is an adapter-specific format
/// capability checked at startup.
pub(crate) const ACCUM_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

/// Depth format paired with the accumulation target.
pub(crate) const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Unweighted additive accumulation: `srcAlpha * src + dst` in color,
/// `src + dst` in alpha. Normalisation happens in the display pass.
pub(crate) const ACCUMULATE_BLEND: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::SrcAlpha,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
};

fn create_glsl_module(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    stage: ShaderStage,
) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Glsl {
            shader: Cow::Owned(source.to_owned()),
            stage,
            defines: &[],
        },
    })
}

/// Compiles both trace stages and links the accumulation pipeline.
///
/// The whole build runs inside a validation error scope so compile and link
/// diagnostics are collected without tripping the global error handler. On
/// error nothing is returned and the caller's existing pipeline stays valid;
/// the swap happens only after the scope comes back clean.
pub(crate) fn build_trace_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    vertex_source: &str,
    fragment_source: &str,
) -> Result<wgpu::RenderPipeline> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let vertex = create_glsl_module(device, "trace vertex", vertex_source, ShaderStage::Vertex);
    let fragment = create_glsl_module(
        device,
        "trace fragment",
        fragment_source,
        ShaderStage::Fragment,
    );

    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("trace pipeline"),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: &vertex,
            entry_point: Some("main"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            unclipped_depth: false,
            polygon_mode: wgpu::PolygonMode::Fill,
            conservative: false,
        },
        // The depth attachment exists for target-lifecycle parity only;
        // accumulation draws neither test nor write depth.
        depth_stencil: Some(wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: false,
            depth_compare: wgpu::CompareFunction::Always,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: &fragment,
            entry_point: Some("main"),
            targets: &[Some(wgpu::ColorTargetState {
                format: ACCUM_FORMAT,
                blend: Some(ACCUMULATE_BLEND),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    });

    if let Some(error) = pollster::block_on(device.pop_error_scope()) {
        bail!("trace shader rejected: {error}");
    }

    Ok(pipeline)
}

/// Builds the fixed normalise-and-present pipeline targeting the swapchain.
pub(crate) fn build_display_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    surface_format: wgpu::TextureFormat,
) -> Result<wgpu::RenderPipeline> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let vertex = create_glsl_module(
        device,
        "display vertex",
        DISPLAY_VERTEX_GLSL,
        ShaderStage::Vertex,
    );
    let fragment = create_glsl_module(
        device,
        "display fragment",
        DISPLAY_FRAGMENT_GLSL,
        ShaderStage::Fragment,
    );

    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("display pipeline"),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: &vertex,
            entry_point: Some("main"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            unclipped_depth: false,
            polygon_mode: wgpu::PolygonMode::Fill,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: &fragment,
            entry_point: Some("main"),
            targets: &[Some(wgpu::ColorTargetState {
                format: surface_format,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    });

    if let Some(error) = pollster::block_on(device.pop_error_scope()) {
        bail!("display shader rejected: {error}");
    }

    Ok(pipeline)
}

/// Full-screen triangle for the display pass; the trace pass loads its
/// vertex stage from disk so it can be live-edited alongside the tracer.
const DISPLAY_VERTEX_GLSL: &str = r"#version 450

const vec2 positions[3] = vec2[3](
    vec2(-1.0, -3.0),
    vec2(3.0, 1.0),
    vec2(-1.0, 1.0)
);

void main() {
    gl_Position = vec4(positions[uint(gl_VertexIndex)], 0.0, 1.0);
}
";

/// Normalises the accumulation buffer by the current sample count and
/// outlines the tile being refined. `u_tile_px.x < 0` disables the outline
/// (the final full-frame present).
const DISPLAY_FRAGMENT_GLSL: &str = r"#version 450
layout(location = 0) out vec4 outColor;

layout(std140, set = 0, binding = 0) uniform DisplayParams {
    vec4 u_tile_px;
    int u_sample_count;
    int u_samples;
    vec2 _display_pad;
};

layout(set = 0, binding = 1) uniform texture2D u_accum_tex;
layout(set = 0, binding = 2) uniform sampler u_accum_smp;

void main() {
    ivec2 texel = ivec2(gl_FragCoord.xy);
    vec4 accum = texelFetch(sampler2D(u_accum_tex, u_accum_smp), texel, 0);
    vec3 color = accum.rgb / float(max(u_sample_count, 1));

    if (u_tile_px.x >= 0.0) {
        vec2 px = gl_FragCoord.xy;
        bool inside = px.x >= u_tile_px.x && px.x <= u_tile_px.y
            && px.y >= u_tile_px.z && px.y <= u_tile_px.w;
        bool border = inside
            && (px.x - u_tile_px.x < 1.5 || u_tile_px.y - px.x < 1.5
                || px.y - u_tile_px.z < 1.5 || u_tile_px.w - px.y < 1.5);
        if (border) {
            color = mix(color, vec3(1.0, 0.55, 0.1), 0.75);
        }
    }

    outColor = vec4(color, 1.0);
}
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation_blend_is_unweighted_additive() {
        assert_eq!(ACCUMULATE_BLEND.color.src_factor, wgpu::BlendFactor::SrcAlpha);
        assert_eq!(ACCUMULATE_BLEND.color.dst_factor, wgpu::BlendFactor::One);
        assert_eq!(ACCUMULATE_BLEND.color.operation, wgpu::BlendOperation::Add);
        assert_eq!(ACCUMULATE_BLEND.alpha.src_factor, wgpu::BlendFactor::One);
        assert_eq!(ACCUMULATE_BLEND.alpha.dst_factor, wgpu::BlendFactor::One);
    }

    #[test]
    fn display_shader_normalises_by_sample_count() {
        assert!(DISPLAY_FRAGMENT_GLSL.contains("u_sample_count"));
        assert!(DISPLAY_FRAGMENT_GLSL.contains("texelFetch"));
    }
}
