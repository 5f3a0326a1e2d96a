// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

fn main() {
    cc::Build::new()
        .file("src/runtime/support.c")
        .compile("inproc_runtime_support");

    println!("cargo:rerun-if-changed=src/runtime/support.c");
}
