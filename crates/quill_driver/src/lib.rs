//! The compiler driver: configuration, the front-end contract, per-method
//! normalization (optionally parallel across methods) and module emission.
//!
//! Methods own all blocks and locals they touch, so normalization is safe to
//! run concurrently method-by-method; globals are read-only during the pass
//! and emission runs single-threaded afterwards.

use quill_asm::{
    generate_method_code, get_kernel_info, stack_frame_words, write_module, KernelCode,
    KernelInfo,
};
use quill_diag::{CompilationError, CompilationStep, Diagnostic, DiagnosticBag, Result};
use quill_ir::{
    Instruction, InstructionKind, Method, Module, SmallImmediate, Value, ValueKind,
};
use quill_lower::{check_no_remaining_calls, normalize_method, LoweringOptions};
use serde::{Deserialize, Serialize};
use std::io::Write;

pub use quill_asm::OutputMode;
pub use quill_lower::MathType;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FrontendKind {
    Llvm,
    SpirV,
    Auto,
}

/// Configuration of one compilation run.
#[derive(Copy, Clone, Debug)]
pub struct CompilationConfig {
    pub math_type: MathType,
    pub output_mode: OutputMode,
    pub frontend: FrontendKind,
    pub verify_output: bool,
    /// Normalize the methods of one module on worker threads.
    pub parallel: bool,
}

impl Default for CompilationConfig {
    fn default() -> Self {
        Self {
            math_type: MathType::Strict,
            output_mode: OutputMode::Binary,
            frontend: FrontendKind::Auto,
            verify_output: false,
            parallel: true,
        }
    }
}

/// The contract between a front-end and the core: parse a binary blob of
/// LLVM-IR bitcode or SPIR-V into a populated [`Module`].
pub trait Frontend: Sync {
    fn name(&self) -> &'static str;
    fn parse(&self, input: &[u8], module: &mut Module) -> Result<()>;
}

/// Front-ends compiled into this build. The LLVM and SPIR-V parsers are
/// optional external components; a build without them reports an empty list
/// and the driver refuses inputs it cannot ingest.
pub fn available_frontends() -> &'static [&'static dyn Frontend] {
    &[]
}

pub fn frontend_for(kind: FrontendKind) -> Option<&'static dyn Frontend> {
    let wanted = match kind {
        FrontendKind::Llvm => "llvm",
        FrontendKind::SpirV => "spirv",
        FrontendKind::Auto => return available_frontends().first().copied(),
    };
    available_frontends()
        .iter()
        .copied()
        .find(|frontend| frontend.name() == wanted)
}

/// Sniff the input container format from its magic bytes.
pub fn detect_frontend_kind(input: &[u8]) -> Option<FrontendKind> {
    if input.len() >= 4 {
        if input[..4] == 0x0723_0203u32.to_le_bytes() || input[..4] == 0x0723_0203u32.to_be_bytes()
        {
            return Some(FrontendKind::SpirV);
        }
        if input[..2] == *b"BC" {
            return Some(FrontendKind::Llvm);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Lower all methods of the module to native instructions. With `parallel`
/// set, methods are distributed over up to `available_parallelism` workers;
/// each worker collects its own diagnostics, merged afterwards.
pub fn normalize_module(
    module: &mut Module,
    config: &CompilationConfig,
) -> Result<DiagnosticBag> {
    let options = LoweringOptions {
        math: config.math_type,
    };
    let mut diags = DiagnosticBag::new();
    if !config.parallel || module.methods.len() <= 1 {
        for method in &mut module.methods {
            normalize_method(method, &options, &mut diags)?;
        }
        return Ok(diags);
    }

    let workers = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .min(module.methods.len());
    let chunk_size = module.methods.len().div_ceil(workers);
    let mut outcomes: Vec<Result<DiagnosticBag>> = Vec::new();
    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for chunk in module.methods.chunks_mut(chunk_size) {
            handles.push(scope.spawn(move || -> Result<DiagnosticBag> {
                let mut bag = DiagnosticBag::new();
                for method in chunk {
                    normalize_method(method, &options, &mut bag)?;
                }
                Ok(bag)
            }));
        }
        for handle in handles {
            outcomes.push(handle.join().unwrap_or_else(|_| {
                Err(CompilationError::new(
                    CompilationStep::Optimizer,
                    "Normalization worker panicked",
                ))
            }));
        }
    });
    for outcome in outcomes {
        diags.merge(outcome?);
    }
    Ok(diags)
}

// ---------------------------------------------------------------------------
// Constant materialization
// ---------------------------------------------------------------------------

fn encodable_as_small_immediate(value: &Value) -> bool {
    match &value.kind {
        ValueKind::Literal(lit) => match lit {
            quill_ir::Literal::Real(r) => SmallImmediate::from_float(*r as f32).is_some(),
            other => i32::try_from(other.integer())
                .ok()
                .and_then(SmallImmediate::from_integer)
                .is_some(),
        },
        // vector constants have no inline encoding at all
        ValueKind::Container(_) => false,
        _ => true,
    }
}

/// Rewrite literal operands that do not fit the small-immediate encoding (or
/// that would need two different immediates in one instruction) into explicit
/// load-immediate instructions.
pub fn materialize_constants(method: &mut Method) -> Result<()> {
    let mut it = method.walk_method();
    while !it.is_end_of_method() {
        let Some(inst) = it.get() else {
            it.next_in_method();
            continue;
        };
        match &inst.kind {
            InstructionKind::Move { dest, src } if !encodable_as_small_immediate(src) => {
                let (dest, src) = (dest.clone(), src.clone());
                let Some(lit) = src.literal_value() else {
                    return Err(CompilationError::with_value(
                        CompilationStep::CodeGeneration,
                        "Vector constant cannot be encoded directly",
                        it.method().render_value(&src),
                    ));
                };
                let original = inst.clone();
                it.reset(
                    Instruction::load_immediate(dest, lit).copy_extras_from(&original),
                );
            }
            InstructionKind::Op { first, second, .. } => {
                let mut pending: Vec<(usize, Value)> = Vec::new();
                if !encodable_as_small_immediate(first) {
                    pending.push((0, first.clone()));
                }
                if let Some(second) = second {
                    if !encodable_as_small_immediate(second) {
                        pending.push((1, second.clone()));
                    } else if pending.is_empty()
                        && first.is_literal()
                        && second.is_literal()
                        && first != second
                    {
                        // both operands share the one small-immediate slot
                        pending.push((1, second.clone()));
                    }
                }
                for (index, value) in pending {
                    let Some(lit) = value.literal_value() else {
                        return Err(CompilationError::with_value(
                            CompilationStep::CodeGeneration,
                            "Vector constant cannot be encoded directly",
                            it.method().render_value(&value),
                        ));
                    };
                    let tmp = it.method_mut().add_new_local(value.ty.clone(), "%immediate");
                    it.emplace(Instruction::load_immediate(tmp.clone(), lit));
                    it.next_in_block();
                    it.modify(|inst| inst.set_argument(index, tmp.clone()));
                }
            }
            _ => {}
        }
        it.next_in_method();
    }
    drop(it);
    Ok(())
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Everything a caller wants to know about a finished compilation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompileSummary {
    pub kernels: Vec<KernelInfo>,
    pub global_data_offset: u64,
    pub global_data_size: u64,
    pub diagnostics: Vec<Diagnostic>,
}

/// Compile a populated module: normalize every method, generate code for the
/// kernels and serialize the binary in the configured output mode.
pub fn compile_module(
    module: &mut Module,
    config: &CompilationConfig,
    out: &mut dyn Write,
) -> Result<CompileSummary> {
    let mut diags = normalize_module(module, config)?;
    for method in &module.methods {
        check_no_remaining_calls(method)?;
    }
    for method in &mut module.methods {
        materialize_constants(method)?;
    }

    let mut infos: Vec<KernelInfo> = Vec::new();
    let mut codes: Vec<KernelCode> = Vec::new();
    let mut offset = 0usize;
    for method in module.methods.iter().filter(|m| m.is_kernel) {
        let code = generate_method_code(method)?;
        let info = get_kernel_info(method, offset, code.words.len(), &mut diags);
        offset += code.words.len();
        infos.push(info);
        codes.push(code);
    }

    let module_info = write_module(
        out,
        config.output_mode,
        &infos,
        &codes,
        &module.globals,
        stack_frame_words(module),
    )?;
    Ok(CompileSummary {
        kernels: infos,
        global_data_offset: module_info.global_data_offset(),
        global_data_size: module_info.global_data_size(),
        diagnostics: diags.diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_isa::{DataType, TYPE_INT32, TYPE_UINT16};
    use quill_ir::{Instruction, DEFAULT_BLOCK_NAME, NOP_REGISTER};

    fn method_with_block(name: &str) -> Method {
        let mut method = Method::new(name);
        let label = method.find_or_create_local(DataType::Label, DEFAULT_BLOCK_NAME);
        method.add_block(label);
        method
    }

    #[test]
    fn no_frontends_ship_in_this_build() {
        assert!(available_frontends().is_empty());
        assert!(frontend_for(FrontendKind::Llvm).is_none());
        assert!(frontend_for(FrontendKind::Auto).is_none());
    }

    #[test]
    fn frontend_detection_by_magic() {
        assert_eq!(
            detect_frontend_kind(&0x0723_0203u32.to_le_bytes()),
            Some(FrontendKind::SpirV)
        );
        assert_eq!(
            detect_frontend_kind(b"BC\xC0\xDE"),
            Some(FrontendKind::Llvm)
        );
        assert_eq!(detect_frontend_kind(b"plain text"), None);
    }

    #[test]
    fn large_constants_become_load_immediates() {
        let mut method = method_with_block("k");
        let a = method.add_new_local(TYPE_INT32, "%a");
        let out = method.add_new_local(TYPE_INT32, "%out");
        method.append_to_end(Instruction::binary(
            quill_isa::OP_AND,
            out.clone(),
            a.clone(),
            Value::int(0xFFFF, TYPE_INT32),
        ));
        materialize_constants(&mut method).unwrap();
        let instructions: Vec<Instruction> = method
            .block_instructions(quill_ir::BlockId(0))
            .map(|(_, inst)| inst.clone())
            .collect();
        assert_eq!(instructions.len(), 2);
        assert!(matches!(
            &instructions[0].kind,
            InstructionKind::LoadImmediate { immediate, .. } if immediate.integer() == 0xFFFF
        ));
        match &instructions[1].kind {
            InstructionKind::Op { second, .. } => {
                assert!(second.as_ref().unwrap().local_id().is_some());
            }
            other => panic!("expected the and to survive, got {:?}", other),
        }
    }

    #[test]
    fn small_constants_stay_inline() {
        let mut method = method_with_block("k");
        let a = method.add_new_local(TYPE_INT32, "%a");
        method.append_to_end(Instruction::binary(
            quill_isa::OP_SHR,
            NOP_REGISTER,
            a.clone(),
            Value::int(15, TYPE_INT32),
        ));
        materialize_constants(&mut method).unwrap();
        assert_eq!(method.count_instructions(), 1);
    }

    #[test]
    fn two_distinct_literals_split_into_a_load() {
        let mut method = method_with_block("k");
        let out = method.add_new_local(TYPE_INT32, "%out");
        method.append_to_end(Instruction::binary(
            quill_isa::OP_ADD,
            out,
            Value::int(3, TYPE_INT32),
            Value::int(5, TYPE_INT32),
        ));
        materialize_constants(&mut method).unwrap();
        assert_eq!(method.count_instructions(), 2);
    }

    #[test]
    fn parallel_normalization_lowers_every_method() {
        let mut module = Module::default();
        for index in 0..4 {
            let mut method = method_with_block(&format!("k{}", index));
            method.is_kernel = true;
            let out = method.add_new_local(TYPE_UINT16, "%out");
            let n = method.add_new_local(TYPE_UINT16, "%n");
            method.append_to_end(Instruction::named_op(
                "udiv",
                out,
                n,
                Some(Value::int(7, TYPE_UINT16)),
            ));
            module.methods.push(method);
        }
        let config = CompilationConfig::default();
        normalize_module(&mut module, &config).unwrap();
        for method in &module.methods {
            check_no_remaining_calls(method).unwrap();
            assert!(method.count_instructions() > 1, "division was lowered");
        }
    }
}
