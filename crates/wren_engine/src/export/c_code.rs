//! C code export for embedded deployment: static weight arrays, a config
//! header of `#define`s, and inference stubs.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::Result;
use crate::models::Model;
use crate::params::ModelState;
use crate::quant::{quantize_tensor, QuantMode};

#[derive(Clone, Copy, Debug)]
pub struct CExportConfig {
    /// Emit int8 arrays with a per-parameter scale float instead of f32.
    pub quantize: bool,
    pub quantize_bits: u8,
}

impl Default for CExportConfig {
    fn default() -> Self {
        Self {
            quantize: true,
            quantize_bits: 8,
        }
    }
}

/// Write `model_weights.h`, `model_config.h`, `model_inference.h`, and
/// `model_inference.c` into `output_dir`.
pub fn export_to_c(model: &mut dyn Model, output_dir: &Path, config: CExportConfig) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;
    tracing::info!("exporting model to C code: {:?}", output_dir);

    std::fs::write(
        output_dir.join("model_weights.h"),
        weights_header(model, config)?,
    )?;
    std::fs::write(output_dir.join("model_config.h"), config_header(model, config))?;
    std::fs::write(output_dir.join("model_inference.h"), inference_header(model))?;
    std::fs::write(output_dir.join("model_inference.c"), inference_source(model))?;

    model.store_mut().state = ModelState::Exported;
    tracing::info!("C code export complete: {:?}", output_dir);
    Ok(())
}

/// C identifiers fold `.` and `-` into `_`.
fn safe_ident(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

fn weights_header(model: &dyn Model, config: CExportConfig) -> Result<String> {
    let mut out = String::new();
    let _ = writeln!(out, "/**");
    let _ = writeln!(out, " * {} weights", model.store().name);
    let _ = writeln!(out, " * Auto-generated - do not edit");
    let _ = writeln!(out, " */");
    let _ = writeln!(out);
    let _ = writeln!(out, "#ifndef WREN_MODEL_WEIGHTS_H");
    let _ = writeln!(out, "#define WREN_MODEL_WEIGHTS_H");
    let _ = writeln!(out);
    let _ = writeln!(out, "#include <stdint.h>");
    let _ = writeln!(out);

    for (name, param) in model.store().params().iter() {
        let ident = safe_ident(name);

        if config.quantize {
            let (quantized, qp) = quantize_tensor(param, QuantMode::Int8, true)?;
            let data = quantized.as_i8()?;
            let _ = writeln!(out, "static const float {ident}_scale = {:e}f;", qp.scale);
            let _ = writeln!(out, "static const int8_t {ident}_data[{}] = {{", data.len());
            for chunk in data.chunks(16) {
                let row: Vec<String> = chunk.iter().map(|v| v.to_string()).collect();
                let _ = writeln!(out, "    {},", row.join(", "));
            }
            let _ = writeln!(out, "}};");
        } else {
            let data = param.as_f32()?;
            let _ = writeln!(out, "static const float {ident}_data[{}] = {{", data.len());
            for chunk in data.chunks(8) {
                let row: Vec<String> = chunk.iter().map(|v| format!("{v:e}f")).collect();
                let _ = writeln!(out, "    {},", row.join(", "));
            }
            let _ = writeln!(out, "}};");
        }

        let shape = param.shape();
        let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
        let _ = writeln!(
            out,
            "static const int {ident}_shape[{}] = {{{}}};",
            shape.len(),
            dims.join(", ")
        );
        let _ = writeln!(out, "static const int {ident}_ndim = {};", shape.len());
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "#endif /* WREN_MODEL_WEIGHTS_H */");
    Ok(out)
}

fn config_header(model: &dyn Model, config: CExportConfig) -> String {
    let metadata = model.metadata();
    let mut out = String::new();
    let _ = writeln!(out, "/**");
    let _ = writeln!(out, " * {} configuration", metadata.name);
    let _ = writeln!(out, " * Auto-generated - do not edit");
    let _ = writeln!(out, " */");
    let _ = writeln!(out);
    let _ = writeln!(out, "#ifndef WREN_MODEL_CONFIG_H");
    let _ = writeln!(out, "#define WREN_MODEL_CONFIG_H");
    let _ = writeln!(out);
    let _ = writeln!(out, "#define WREN_MODEL_NAME \"{}\"", metadata.name);
    let _ = writeln!(out, "#define WREN_MODEL_ARCH \"{}\"", metadata.architecture);
    let _ = writeln!(out, "#define WREN_NUM_PARAMETERS {}", metadata.parameters);
    let _ = writeln!(out);
    let _ = writeln!(out, "#define WREN_INPUT_NDIM {}", metadata.input_shape.len());
    let _ = writeln!(out, "#define WREN_OUTPUT_NDIM {}", metadata.output_shape.len());
    let _ = writeln!(out);
    for (i, dim) in metadata.input_shape.iter().enumerate() {
        let _ = writeln!(out, "#define WREN_INPUT_DIM_{i} {dim}");
    }
    for (i, dim) in metadata.output_shape.iter().enumerate() {
        let _ = writeln!(out, "#define WREN_OUTPUT_DIM_{i} {dim}");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "#define WREN_QUANTIZED {}", u8::from(config.quantize));
    if config.quantize {
        let _ = writeln!(out, "#define WREN_QUANT_BITS {}", config.quantize_bits);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "#endif /* WREN_MODEL_CONFIG_H */");
    out
}

fn inference_header(model: &dyn Model) -> String {
    let name = model.store().name.clone();
    format!(
        r#"/**
 * {name} inference interface
 * Auto-generated - do not edit
 */

#ifndef WREN_MODEL_INFERENCE_H
#define WREN_MODEL_INFERENCE_H

#include <stddef.h>

#include "model_config.h"

/* Opaque inference state. */
typedef struct wren_model wren_model_t;

/* Allocate and initialize the model from the embedded weights. */
wren_model_t* wren_model_init(void);

/* Run one forward pass. Input and output are row-major float buffers of
 * the dimensions declared in model_config.h. Returns 0 on success. */
int wren_model_predict(wren_model_t* model, const float* input, size_t input_len,
                       float* output, size_t output_len);

/* Release all model resources. */
void wren_model_cleanup(wren_model_t* model);

#endif /* WREN_MODEL_INFERENCE_H */
"#
    )
}

fn inference_source(model: &dyn Model) -> String {
    let name = model.store().name.clone();
    format!(
        r#"/**
 * {name} inference stubs
 * Auto-generated - do not edit
 *
 * The arithmetic for the embedded target is expected to be filled in by
 * the integrating firmware; the weight arrays and dimensions are complete.
 */

#include <stdlib.h>
#include <string.h>

#include "model_inference.h"
#include "model_weights.h"

struct wren_model {{
    int initialized;
}};

wren_model_t* wren_model_init(void) {{
    wren_model_t* model = (wren_model_t*)malloc(sizeof(wren_model_t));
    if (model == NULL) {{
        return NULL;
    }}
    model->initialized = 1;
    return model;
}}

int wren_model_predict(wren_model_t* model, const float* input, size_t input_len,
                       float* output, size_t output_len) {{
    if (model == NULL || !model->initialized) {{
        return -1;
    }}
    (void)input;
    (void)input_len;
    memset(output, 0, output_len * sizeof(float));
    return 0;
}}

void wren_model_cleanup(wren_model_t* model) {{
    free(model);
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classifier, ClassifierConfig};

    #[test]
    fn bundle_has_all_files_and_safe_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = Classifier::new(ClassifierConfig {
            input_dim: 3,
            hidden_dims: vec![],
            num_classes: 2,
            multi_label: false,
            dropout: 0.0,
        })
        .unwrap();

        export_to_c(&mut model, dir.path(), CExportConfig::default()).unwrap();

        for file in [
            "model_weights.h",
            "model_config.h",
            "model_inference.h",
            "model_inference.c",
        ] {
            assert!(dir.path().join(file).exists(), "missing {file}");
        }
        assert_eq!(model.store().state, ModelState::Exported);

        let weights = std::fs::read_to_string(dir.path().join("model_weights.h")).unwrap();
        assert!(weights.contains("layer_0_weight_data"));
        assert!(weights.contains("layer_0_weight_scale"));
        assert!(weights.contains("int8_t"));

        let config = std::fs::read_to_string(dir.path().join("model_config.h")).unwrap();
        assert!(config.contains("#define WREN_INPUT_DIM_0 3"));
        assert!(config.contains("#define WREN_QUANTIZED 1"));
    }

    #[test]
    fn float_export_when_quantize_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = Classifier::new(ClassifierConfig {
            input_dim: 2,
            hidden_dims: vec![],
            num_classes: 2,
            multi_label: false,
            dropout: 0.0,
        })
        .unwrap();

        export_to_c(
            &mut model,
            dir.path(),
            CExportConfig {
                quantize: false,
                quantize_bits: 8,
            },
        )
        .unwrap();

        let weights = std::fs::read_to_string(dir.path().join("model_weights.h")).unwrap();
        assert!(!weights.contains("int8_t"));
        assert!(weights.contains("static const float layer_0_weight_data"));
    }
}
