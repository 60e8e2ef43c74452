// SPDX-License-Identifier: CEPL-1.0
// With `compile-shaders`, compiles ../../shaders/*.{vert,frag} to SPIR-V in
// OUT_DIR and exports the directory as LUMEN_SHADER_DIR. Without it the
// renderer loads prebuilt binaries from its configured shader directory.

fn main() {
    #[cfg(feature = "compile-shaders")]
    compile::run();
}

#[cfg(feature = "compile-shaders")]
mod compile {
    use std::{env, fs, path::PathBuf};

    const STAGES: [(&str, shaderc::ShaderKind); 2] = [
        ("vert", shaderc::ShaderKind::Vertex),
        ("frag", shaderc::ShaderKind::Fragment),
    ];
    const PASSES: [&str; 2] = ["gbuffer", "lighting"];

    pub fn run() {
        let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR set by cargo"));
        let src_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("manifest dir"))
            .join("../../shaders");

        let comp = shaderc::Compiler::new().expect("shaderc compiler");
        let mut opts = shaderc::CompileOptions::new().expect("shaderc options");
        opts.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_2 as u32,
        );
        opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

        for pass in PASSES {
            for (ext, kind) in STAGES {
                let name = format!("{pass}.{ext}");
                let path = src_dir.join(&name);
                println!("cargo:rerun-if-changed={}", path.display());
                let source = fs::read_to_string(&path)
                    .unwrap_or_else(|e| panic!("reading {}: {e}", path.display()));
                let spv = comp
                    .compile_into_spirv(&source, kind, &name, "main", Some(&opts))
                    .unwrap_or_else(|e| panic!("compiling {name}: {e}"));
                fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8())
                    .unwrap_or_else(|e| panic!("writing {name}.spv: {e}"));
            }
        }

        println!("cargo:rustc-env=LUMEN_SHADER_DIR={}", out.display());
        println!("cargo:rerun-if-changed=build.rs");
    }
}
