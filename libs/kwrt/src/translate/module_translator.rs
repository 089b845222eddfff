// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::vec::Vec;

use wasmparser::{
    BinaryReader, DataSectionReader, ElementItems, ElementSectionReader, Encoding,
    ExportSectionReader, ExternalKind, FunctionSectionReader, GlobalSectionReader,
    ImportSectionReader, MemorySectionReader, Name, NameSectionReader, Parser, Payload, TableInit,
    TableSectionReader, TypeRef, TypeSectionReader,
};

use crate::errors::{Error, wasm_unsupported};
use crate::indices::{
    DataIndex, ElemIndex, EntityIndex, FuncIndex, GlobalIndex, MemoryIndex, TableIndex, TypeIndex,
};
use crate::translate::func_translator::FuncTranslator;
use crate::translate::type_convert::{
    convert_func_type, convert_global_type, convert_memory_type, convert_ref_type,
    convert_table_type,
};
use crate::translate::{
    ConstExpr, DataKind, DataSegment, ElementKind, ElementSegment, FunctionDesc, Import,
    TranslatedModule,
};
use crate::types::{EntityKind, EntityType, RefType};

/// A translator for converting the output of `wasmparser` into types used by this crate.
#[derive(Default)]
pub struct ModuleTranslator {
    result: TranslatedModule,
    code_section_count: Option<u32>,
}

impl ModuleTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate raw WASM bytes into a `TranslatedModule`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Malformed` if the binary is not structurally well-formed and
    /// `Error::Unsupported` if it uses a proposal outside of the core instruction set.
    #[tracing::instrument(level = "debug", skip_all, fields(len = data.len()))]
    pub fn translate(mut self, data: &[u8]) -> crate::Result<TranslatedModule> {
        let parser = Parser::new(0);

        for payload in parser.parse_all(data) {
            self.translate_payload(payload?)?;
        }

        debug_assert!(self.result.num_tables() >= self.result.num_imported_tables);
        debug_assert!(self.result.num_memories() >= self.result.num_imported_memories);
        debug_assert!(self.result.num_globals() >= self.result.num_imported_globals);

        tracing::debug!(
            functions = self.result.num_functions(),
            imports = self.result.imports.len(),
            exports = self.result.exports.len(),
            "translated module"
        );

        Ok(self.result)
    }

    /// Translates a single payload (essentially a section) of a WASM module.
    fn translate_payload(&mut self, payload: Payload<'_>) -> crate::Result<()> {
        match payload {
            Payload::Version {
                encoding, range, ..
            } => {
                if encoding != Encoding::Module {
                    return Err(Error::Malformed {
                        message: "expected a core module, found a component".into(),
                        offset: range.start,
                    });
                }
            }
            Payload::TypeSection(types) => self.translate_type_section(types)?,
            Payload::ImportSection(imports) => self.translate_import_section(imports)?,
            Payload::FunctionSection(functions) => self.translate_function_section(functions)?,
            Payload::TableSection(tables) => self.translate_table_section(tables)?,
            Payload::MemorySection(memories) => self.translate_memory_section(memories)?,
            Payload::TagSection(_) => return Err(wasm_unsupported!("exception handling")),
            Payload::GlobalSection(globals) => self.translate_global_section(globals)?,
            Payload::ExportSection(exports) => self.translate_export_section(exports)?,
            Payload::StartSection { func, range } => {
                let func = FuncIndex::from_u32(func);
                if !self.result.functions.is_valid(func) {
                    return Err(Error::Malformed {
                        message: "unknown start function".into(),
                        offset: range.start,
                    });
                }
                self.result.start = Some(func);
            }
            Payload::ElementSection(elements) => self.translate_element_section(elements)?,
            Payload::DataCountSection { count, .. } => {
                self.result.data_count = Some(count);
            }
            Payload::DataSection(data) => self.translate_data_section(data)?,
            Payload::CodeSectionStart { count, range, .. } => {
                if count != self.result.num_defined_functions() {
                    return Err(Error::Malformed {
                        message: "function and code section have inconsistent lengths".into(),
                        offset: range.start,
                    });
                }
                self.code_section_count = Some(count);
                self.result.function_bodies.reserve_exact(count as usize);
            }
            Payload::CodeSectionEntry(body) => {
                let index = self.result.func_index(self.result.function_bodies.next_key());
                tracing::trace!(?index, "translating function body");
                let body = FuncTranslator::new().translate(&body)?;
                self.result.function_bodies.push(body);
            }
            Payload::CustomSection(section) => match section.name() {
                "name" => {
                    let reader = NameSectionReader::new(BinaryReader::new(
                        section.data(),
                        section.data_offset(),
                    ));
                    self.translate_name_section(reader);
                }
                name => tracing::warn!("unhandled custom section {name}"),
            },
            Payload::End(offset) => {
                if self.code_section_count.is_none() && self.result.num_defined_functions() > 0 {
                    return Err(Error::Malformed {
                        message: "function and code section have inconsistent lengths".into(),
                        offset,
                    });
                }
                if let Some(count) = self.result.data_count {
                    if count as usize != self.result.data.len() {
                        return Err(Error::Malformed {
                            message: "data count and data section have inconsistent lengths"
                                .into(),
                            offset,
                        });
                    }
                }
            }
            p => tracing::warn!("unknown section {p:?}"),
        }
        Ok(())
    }

    fn flag_func_as_escaped(&mut self, func_index: FuncIndex) {
        if let Some(desc) = self.result.functions.get_mut(func_index) {
            desc.escaping = true;
        }
    }

    #[expect(
        clippy::needless_pass_by_value,
        reason = "translate_ methods consume their readers"
    )]
    fn translate_type_section(&mut self, types: TypeSectionReader<'_>) -> crate::Result<()> {
        for rec_group in types {
            let rec_group = rec_group?;
            if rec_group.is_explicit_rec_group() {
                return Err(wasm_unsupported!("explicit recursion groups"));
            }
            for ty in rec_group.into_types() {
                if !ty.is_final || ty.supertype_idx.is_some() {
                    return Err(wasm_unsupported!("subtyping"));
                }
                match &ty.composite_type.inner {
                    wasmparser::CompositeInnerType::Func(func) if !ty.composite_type.shared => {
                        self.result.types.push(convert_func_type(func)?);
                    }
                    other => return Err(wasm_unsupported!("composite type {other:?}")),
                }
            }
        }

        Ok(())
    }

    fn check_type_index(&self, index: u32, offset: usize) -> crate::Result<TypeIndex> {
        let index = TypeIndex::from_u32(index);
        if self.result.types.is_valid(index) {
            Ok(index)
        } else {
            Err(Error::Malformed {
                message: alloc::format!("unknown type {}", index.as_u32()),
                offset,
            })
        }
    }

    fn translate_import_section(&mut self, imports: ImportSectionReader<'_>) -> crate::Result<()> {
        self.result.imports.reserve_exact(imports.count() as usize);

        for import in imports.into_iter_with_offsets() {
            let (offset, import) = import?;

            let (ty, index) = match import.ty {
                TypeRef::Func(index) => {
                    self.result.num_imported_functions += 1;

                    let signature = self.check_type_index(index, offset)?;
                    let index = self.result.functions.push(FunctionDesc {
                        signature,
                        escaping: false,
                    });
                    (
                        EntityType::Function(self.result.types[signature].clone()),
                        EntityIndex::Function(index),
                    )
                }
                TypeRef::Table(ty) => {
                    self.result.num_imported_tables += 1;

                    let ty = convert_table_type(&ty)?;
                    let index = self.result.tables.push(ty);
                    (EntityType::Table(ty), EntityIndex::Table(index))
                }
                TypeRef::Memory(ty) => {
                    self.result.num_imported_memories += 1;

                    let ty = convert_memory_type(&ty)?;
                    let index = self.push_memory(ty)?;
                    (EntityType::Memory(ty), EntityIndex::Memory(index))
                }
                TypeRef::Global(ty) => {
                    self.result.num_imported_globals += 1;

                    let ty = convert_global_type(&ty)?;
                    let index = self.result.globals.push(ty);
                    (EntityType::Global(ty), EntityIndex::Global(index))
                }
                TypeRef::Tag(_) => return Err(wasm_unsupported!("exception handling")),
            };

            self.result.imports.push(Import {
                module: import.module.to_string(),
                name: import.name.to_string(),
                ty,
                index,
            });
        }

        Ok(())
    }

    fn translate_function_section(
        &mut self,
        functions: FunctionSectionReader<'_>,
    ) -> crate::Result<()> {
        self.result
            .functions
            .reserve_exact(functions.count() as usize);

        for index in functions.into_iter_with_offsets() {
            let (offset, index) = index?;
            let signature = self.check_type_index(index, offset)?;
            self.result.functions.push(FunctionDesc {
                signature,
                escaping: false,
            });
        }

        Ok(())
    }

    fn translate_table_section(&mut self, tables: TableSectionReader<'_>) -> crate::Result<()> {
        self.result.tables.reserve_exact(tables.count() as usize);

        for table in tables {
            let table = table?;
            if let TableInit::Expr(_) = table.init {
                return Err(wasm_unsupported!("table initializer expressions"));
            }
            self.result.tables.push(convert_table_type(&table.ty)?);
        }

        Ok(())
    }

    fn push_memory(&mut self, ty: crate::types::MemoryType) -> crate::Result<MemoryIndex> {
        if !self.result.memories.is_empty() {
            return Err(wasm_unsupported!("multiple memories"));
        }
        Ok(self.result.memories.push(ty))
    }

    fn translate_memory_section(&mut self, memories: MemorySectionReader<'_>) -> crate::Result<()> {
        for ty in memories {
            let ty = convert_memory_type(&ty?)?;
            self.push_memory(ty)?;
        }

        Ok(())
    }

    fn translate_global_section(&mut self, globals: GlobalSectionReader<'_>) -> crate::Result<()> {
        self.result.globals.reserve_exact(globals.count() as usize);
        self.result
            .global_initializers
            .reserve_exact(globals.count() as usize);

        for global in globals {
            let global = global?;

            self.result.globals.push(convert_global_type(&global.ty)?);

            let (init_expr, escaped) = ConstExpr::from_wasmparser(&global.init_expr)?;
            for func in escaped {
                self.flag_func_as_escaped(func);
            }
            self.result.global_initializers.push(init_expr);
        }

        Ok(())
    }

    fn translate_export_section(&mut self, exports: ExportSectionReader<'_>) -> crate::Result<()> {
        for export in exports.into_iter_with_offsets() {
            let (offset, export) = export?;
            let (index, in_bounds) = match export.kind {
                ExternalKind::Func => {
                    let index = FuncIndex::from_u32(export.index);
                    self.flag_func_as_escaped(index);
                    (
                        EntityIndex::Function(index),
                        self.result.functions.is_valid(index),
                    )
                }
                ExternalKind::Table => {
                    let index = TableIndex::from_u32(export.index);
                    (EntityIndex::Table(index), self.result.tables.is_valid(index))
                }
                ExternalKind::Memory => {
                    let index = MemoryIndex::from_u32(export.index);
                    (
                        EntityIndex::Memory(index),
                        self.result.memories.is_valid(index),
                    )
                }
                ExternalKind::Global => {
                    let index = GlobalIndex::from_u32(export.index);
                    (
                        EntityIndex::Global(index),
                        self.result.globals.is_valid(index),
                    )
                }
                ExternalKind::Tag => return Err(wasm_unsupported!("exception handling")),
            };

            if !in_bounds {
                let kind = match index {
                    EntityIndex::Function(_) => EntityKind::Function,
                    EntityIndex::Table(_) => EntityKind::Table,
                    EntityIndex::Memory(_) => EntityKind::Memory,
                    EntityIndex::Global(_) => EntityKind::Global,
                };
                return Err(Error::Malformed {
                    message: alloc::format!("unknown {kind} {}", export.index),
                    offset,
                });
            }

            if self
                .result
                .exports
                .insert(export.name.to_string(), index)
                .is_some()
            {
                return Err(Error::Malformed {
                    message: alloc::format!("duplicate export name `{}`", export.name),
                    offset,
                });
            }
        }

        Ok(())
    }

    fn translate_element_section(&mut self, elements: ElementSectionReader<'_>) -> crate::Result<()> {
        for element in elements {
            let element = element?;

            let (ty, items) = match element.items {
                ElementItems::Functions(funcs) => {
                    let mut out = Vec::with_capacity(funcs.count() as usize);
                    for func_idx in funcs {
                        let func = FuncIndex::from_u32(func_idx?);
                        self.flag_func_as_escaped(func);
                        out.push(ConstExpr::ref_func(func));
                    }
                    (RefType::Func, out)
                }
                ElementItems::Expressions(ty, exprs) => {
                    let ty = convert_ref_type(ty)?;
                    let mut out = Vec::with_capacity(exprs.count() as usize);
                    for expr in exprs {
                        let (expr, escaped) = ConstExpr::from_wasmparser(&expr?)?;
                        for func in escaped {
                            self.flag_func_as_escaped(func);
                        }
                        out.push(expr);
                    }
                    (ty, out)
                }
            };

            let kind = match element.kind {
                wasmparser::ElementKind::Active {
                    table_index,
                    offset_expr,
                } => {
                    let (offset, escaped) = ConstExpr::from_wasmparser(&offset_expr)?;
                    debug_assert!(escaped.is_empty());
                    ElementKind::Active {
                        table: TableIndex::from_u32(table_index.unwrap_or(0)),
                        offset,
                    }
                }
                wasmparser::ElementKind::Passive => ElementKind::Passive,
                wasmparser::ElementKind::Declared => ElementKind::Declared,
            };

            let index: ElemIndex = self.result.elements.push(ElementSegment {
                kind,
                ty,
                items: items.into_boxed_slice(),
            });
            tracing::trace!(?index, "translated element segment");
        }

        Ok(())
    }

    fn translate_data_section(&mut self, section: DataSectionReader<'_>) -> crate::Result<()> {
        for entry in section {
            let entry = entry?;

            let kind = match entry.kind {
                wasmparser::DataKind::Active {
                    memory_index,
                    offset_expr,
                } => {
                    let (offset, escaped) = ConstExpr::from_wasmparser(&offset_expr)?;
                    debug_assert!(escaped.is_empty());
                    DataKind::Active {
                        memory: MemoryIndex::from_u32(memory_index),
                        offset,
                    }
                }
                wasmparser::DataKind::Passive => DataKind::Passive,
            };

            let index: DataIndex = self.result.data.push(DataSegment {
                kind,
                data: Box::from(entry.data),
            });
            tracing::trace!(?index, "translated data segment");
        }

        Ok(())
    }

    /// Picks the module name out of the name section. Malformed name sections are
    /// ignored, they never affect execution.
    fn translate_name_section(&mut self, reader: NameSectionReader<'_>) {
        for subsection in reader {
            match subsection {
                Ok(Name::Module { name, .. }) => {
                    self.result.name = Some(name.to_string());
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("ignoring malformed name section: {err}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValType;

    fn translate(wat: &str) -> crate::Result<TranslatedModule> {
        ModuleTranslator::new().translate(&wat::parse_str(wat).unwrap())
    }

    #[test]
    fn index_spaces_place_imports_first() {
        let module = translate(
            r#"(module
                (import "env" "f" (func (param i32)))
                (import "env" "g" (global i32))
                (global i64 (i64.const 7))
                (func (export "run") (result i32) i32.const 1)
            )"#,
        )
        .unwrap();

        assert_eq!(module.num_imported_functions, 1);
        assert_eq!(module.num_functions(), 2);
        assert_eq!(module.num_imported_globals, 1);
        assert_eq!(module.num_defined_globals(), 1);
        assert_eq!(module.function_bodies.len(), 1);
        assert!(module.is_imported_func(FuncIndex::from_u32(0)));
        assert_eq!(
            module.exports.get("run"),
            Some(&EntityIndex::Function(FuncIndex::from_u32(1)))
        );
        assert!(module.functions[FuncIndex::from_u32(1)].escaping);
        assert!(!module.functions[FuncIndex::from_u32(0)].escaping);
        assert_eq!(
            module.func_type(FuncIndex::from_u32(1)).unwrap().results(),
            &[ValType::I32]
        );
    }

    #[test]
    fn element_segments_flag_escaping_functions() {
        let module = translate(
            r#"(module
                (table 4 funcref)
                (func $a) (func $b) (func $c)
                (elem (i32.const 1) $a $b)
                (elem declare func $c)
            )"#,
        )
        .unwrap();

        assert_eq!(module.elements.len(), 2);
        assert!(matches!(
            module.elements[ElemIndex::from_u32(0)].kind,
            ElementKind::Active { .. }
        ));
        assert!(matches!(
            module.elements[ElemIndex::from_u32(1)].kind,
            ElementKind::Declared
        ));
        assert!(module.functions.values().all(|f| f.escaping));
    }

    #[test]
    fn simd_is_unsupported() {
        let err = translate("(module (func (param v128)))").unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)), "{err}");
    }

    #[test]
    fn v128_const_initializers_are_rejected() {
        translate("(module (global v128 (v128.const i32x4 0 0 0 0)))").unwrap_err();
    }

    #[test]
    fn module_name_is_recorded() {
        let module = translate("(module $answer)").unwrap();
        assert_eq!(module.name.as_deref(), Some("answer"));
    }
}
