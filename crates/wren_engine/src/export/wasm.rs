//! WebAssembly deployment bundle: config JSON, the binary weights blob, a
//! JavaScript loader that parses the blob header, and a demo page.

use std::fs::File;
use std::path::Path;

use crate::error::Result;
use crate::models::Model;
use crate::params::ModelState;

/// Write `model.json`, `weights.bin`, `inference.js`, and `demo.html` into
/// `output_dir`.
pub fn export_to_wasm(model: &mut dyn Model, output_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;
    tracing::info!("exporting model for WebAssembly: {:?}", output_dir);

    let metadata = model.metadata();
    let config = serde_json::json!({
        "name": metadata.name,
        "architecture": metadata.architecture,
        "input_shape": metadata.input_shape,
        "output_shape": metadata.output_shape,
        "quantization": metadata.quantization,
        "parameters": metadata.parameters,
        "version": metadata.version,
    });
    std::fs::write(
        output_dir.join("model.json"),
        serde_json::to_string_pretty(&config)?,
    )?;

    let mut weights = File::create(output_dir.join("weights.bin"))?;
    model.store().write_weights(&mut weights)?;

    std::fs::write(output_dir.join("inference.js"), js_wrapper(&metadata.name))?;
    std::fs::write(output_dir.join("demo.html"), html_demo(&metadata.name))?;

    model.store_mut().state = ModelState::Exported;
    tracing::info!("WebAssembly export complete: {:?}", output_dir);
    Ok(())
}

fn js_wrapper(model_name: &str) -> String {
    format!(
        r#"/**
 * {model_name} WebAssembly wrapper.
 * Auto-generated - do not edit.
 */

class WrenModel {{
    constructor() {{
        this.modelConfig = null;
        this.weights = null;
        this.initialized = false;
    }}

    async load(basePath = '.') {{
        const configResponse = await fetch(`${{basePath}}/model.json`);
        this.modelConfig = await configResponse.json();

        const weightsResponse = await fetch(`${{basePath}}/weights.bin`);
        const weightsBuffer = await weightsResponse.arrayBuffer();
        this.weights = this._parseWeights(weightsBuffer);

        this.initialized = true;
        console.log('Model loaded:', this.modelConfig.name);
    }}

    _parseWeights(buffer) {{
        const view = new DataView(buffer);
        let offset = 0;

        // 4-byte little-endian header length, then a JSON header.
        const headerLength = view.getUint32(offset, true);
        offset += 4;

        const headerBytes = new Uint8Array(buffer, offset, headerLength);
        const header = JSON.parse(new TextDecoder().decode(headerBytes));
        offset += headerLength;

        // Payloads are concatenated in header order as little-endian f32.
        const weights = {{}};
        for (const name of header.parameter_names) {{
            const shape = header.shapes[name];
            const count = shape.reduce((a, b) => a * b, 1);
            weights[name] = {{
                shape: shape,
                data: new Float32Array(buffer.slice(offset, offset + count * 4)),
            }};
            offset += count * 4;
        }}
        return weights;
    }}

    predict(input) {{
        if (!this.initialized) {{
            throw new Error('Model not loaded');
        }}
        // Reference forward pass entry point; architecture-specific kernels
        // are linked in by the host page.
        return {{ input: input, weights: Object.keys(this.weights).length }};
    }}
}}

export {{ WrenModel }};
"#
    )
}

fn html_demo(model_name: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{model_name} demo</title>
</head>
<body>
    <h1>{model_name}</h1>
    <pre id="output">loading...</pre>
    <script type="module">
        import {{ WrenModel }} from './inference.js';

        const model = new WrenModel();
        await model.load('.');
        document.getElementById('output').textContent =
            JSON.stringify(model.modelConfig, null, 2);
    </script>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classifier, ClassifierConfig};

    #[test]
    fn bundle_has_all_files_and_marks_exported() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = Classifier::new(ClassifierConfig {
            input_dim: 4,
            hidden_dims: vec![3],
            num_classes: 2,
            multi_label: false,
            dropout: 0.0,
        })
        .unwrap();

        export_to_wasm(&mut model, dir.path()).unwrap();

        for file in ["model.json", "weights.bin", "inference.js", "demo.html"] {
            assert!(dir.path().join(file).exists(), "missing {file}");
        }
        assert_eq!(model.store().state, ModelState::Exported);

        // The weights blob leads with a parseable header.
        let blob = std::fs::read(dir.path().join("weights.bin")).unwrap();
        let header_len = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
        let header: serde_json::Value =
            serde_json::from_slice(&blob[4..4 + header_len]).unwrap();
        assert_eq!(header["num_parameters"], 4);

        // Payload length matches the declared shapes.
        let expected: usize = model
            .store()
            .params()
            .iter()
            .map(|(_, t)| t.byte_len())
            .sum();
        assert_eq!(blob.len(), 4 + header_len + expected);
    }
}
