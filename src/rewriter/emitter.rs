//! Code generation primitives composed by instrumentation logic.
//!
//! The primitives emit into the [`InstructionSet`] of a [`MethodRewriter`]. Deferred code
//! blocks, like array elements or the bodies of a try/catch region, are passed as
//! [`Generator`] closures which receive the instruction set when their code is due.
//!
//! All reflective lookups reference `mscorlib`. Code of the methods of `mscorlib` itself has
//! to reference its own types without the assembly qualifier, which is what the
//! `in_mscorlib` parameters select.

use crate::{
    assembly::{InstructionSet, OpCode},
    function::Function,
    metadata::signatures::SignatureParameter,
    rewriter::{MethodInfoCacheKey, MethodLookup, MethodRewriter},
    Error, Result,
};

/// A deferred block of code, emitted into the instruction set it is called with
pub type Generator<'g, 'a> = Box<dyn FnOnce(&mut InstructionSet<'a>) -> Result<()> + 'g>;

/// Box `body` as a [`Generator`]
pub fn generator<'g, 'a, G>(body: G) -> Generator<'g, 'a>
where
    G: FnOnce(&mut InstructionSet<'a>) -> Result<()> + 'g,
{
    Box::new(body)
}

/// `Console.WriteLine(string)`
pub const WRITE_LINE: &str = "void [mscorlib]System.Console::WriteLine(string)";

/// Constructor of `System.Exception` taking a message
pub const EXCEPTION_CTOR: &str = "instance void [mscorlib]System.Exception::.ctor(string)";

const EXCEPTION_CTOR_LOCAL: &str = "instance void System.Exception::.ctor(string)";

const TYPE: &str = "[mscorlib]System.Type";

const OBJECT: &str = "[mscorlib]System.Object";

const LOAD_FROM: &str = "class [mscorlib]System.Reflection.Assembly [mscorlib]System.Reflection.Assembly::LoadFrom(string)";

const GET_TYPE: &str =
    "instance class [mscorlib]System.Type [mscorlib]System.Reflection.Assembly::GetType(string)";

const GET_METHOD: &str = "instance class [mscorlib]System.Reflection.MethodInfo [mscorlib]System.Type::GetMethod(string)";

const GET_METHOD_WITH_TYPES: &str = "instance class [mscorlib]System.Reflection.MethodInfo [mscorlib]System.Type::GetMethod(string, class [mscorlib]System.Type[])";

const INVOKE: &str = "instance object [mscorlib]System.Reflection.MethodBase::Invoke(object, object[])";

impl<'a, F: Function + ?Sized> MethodRewriter<'a, F> {
    /// A generator for a `System.Type[]` holding the types of the method parameters, in
    /// declaration order.
    ///
    /// The generator does not borrow the rewriter and can be passed to the other
    /// primitives, e.g. [`MethodRewriter::load_method_info_from_type`].
    #[must_use]
    pub fn array_of_parameter_types(&self) -> Generator<'static, 'a> {
        let params = self.signature.params.clone();
        generator(move |set| emit_parameter_type_array(set, &params))
    }

    /// Emit a `System.Type[]` holding the types of the method parameters.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if a parameter type can not be resolved.
    pub fn emit_array_of_parameter_types(&mut self) -> Result<()> {
        emit_parameter_type_array(&mut self.instructions, &self.signature.params)
    }

    /// Emit an `object[]` holding the argument values of the method.
    ///
    /// Value type arguments are boxed; the implicit `this` is skipped.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if a type specification can not be created for a
    /// value type argument.
    pub fn build_object_array_of_parameters(&mut self) -> Result<()> {
        let mut generators: Vec<Generator<'_, 'a>> =
            Vec::with_capacity(self.signature.params.len());
        for (index, param) in self.signature.params.iter().enumerate() {
            let argument = u16::try_from(self.signature.argument_index(index))
                .map_err(|_| malformed_error!("Argument index {} out of range", index))?;
            generators.push(generator(move |set| {
                set.append_load_argument_and_box(argument, param)
            }));
        }

        emit_array(&mut self.instructions, OBJECT, generators)
    }

    /// Emit an `object[]` with one element per generator.
    ///
    /// Every generator must leave exactly one value on the stack.
    ///
    /// # Errors
    /// Returns [`crate::Error::StackImbalance`] if a generator leaves more or less than one
    /// value, or the error of the generator.
    pub fn load_array(&mut self, generators: Vec<Generator<'_, 'a>>) -> Result<()> {
        emit_array(&mut self.instructions, OBJECT, generators)
    }

    /// Emit a call of `Console.WriteLine` printing `message`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if string or method can not be resolved.
    pub fn write_line_to_console(&mut self, message: &str) -> Result<()> {
        write_line(&mut self.instructions, message)
    }

    /// Load the type `type_name` from the assembly at `assembly_path`, leaving the
    /// `System.Type` on the stack.
    ///
    /// With [`crate::RewriterConfig::diagnostics`] a message is printed if the type was not
    /// found; execution continues with `null` either way.
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if a string or method can not be resolved.
    pub fn load_type(&mut self, assembly_path: &str, type_name: &str) -> Result<()> {
        let set = &mut self.instructions;
        set.append_string(assembly_path)?;
        set.append_call(OpCode::Call, LOAD_FROM)?;
        set.append_string(type_name)?;
        set.append_call(OpCode::Callvirt, GET_TYPE)?;

        if self.config.diagnostics {
            let message = format!("Type {type_name} not found in {assembly_path}");
            emit_not_found_check(set, &message)?;
        }
        Ok(())
    }

    /// Resolve the method `method_name` of the `System.Type` on the stack, replacing it with
    /// the `MethodInfo`.
    ///
    /// Overloads are told apart by `argument_types`, which has to produce a `System.Type[]`,
    /// e.g. [`MethodRewriter::array_of_parameter_types`].
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if a string or method can not be resolved, or the
    /// error of the generator.
    pub fn load_method_info_from_type(
        &mut self,
        method_name: &str,
        argument_types: Option<Generator<'_, 'a>>,
    ) -> Result<()> {
        let set = &mut self.instructions;
        set.append_string(method_name)?;
        match argument_types {
            Some(argument_types) => {
                argument_types(set)?;
                set.append_call(OpCode::Callvirt, GET_METHOD_WITH_TYPES)?;
            }
            None => set.append_call(OpCode::Callvirt, GET_METHOD)?,
        }

        if self.config.diagnostics {
            emit_not_found_check(set, &format!("Method {method_name} not found"))?;
        }
        Ok(())
    }

    /// Invoke the `MethodInfo` on the stack with the target instance and the `object[]` of
    /// arguments above it, leaving the returned object.
    ///
    /// # Errors
    /// Returns [`crate::Error::StackImbalance`] if the three operands are not on the stack.
    pub fn invoke_method_info(&mut self) -> Result<()> {
        self.instructions.append_call(OpCode::Callvirt, INVOKE)
    }

    /// Load the `MethodInfo` of `method_name` in `class_name`, leaving it on the stack.
    ///
    /// With `use_cache` set, and the cache not disabled by
    /// [`crate::RewriterConfig::disable_method_cache`], the lookup goes through the runtime
    /// cache helper, keyed by class, method and `function_id`; only the first lookup of a key
    /// runs reflection. Otherwise the type and method are resolved every time the code runs.
    ///
    /// The first registration of a key wins: a later call with the same key but another
    /// `assembly_path` emits the lookup stored by the first one.
    ///
    /// # Arguments
    /// * `assembly_path` - Path of the assembly defining `class_name`
    /// * `class_name` - Full name of the class
    /// * `method_name` - Name of the method
    /// * `function_id` - Tells apart overloads sharing class and method name
    /// * `argument_types` - Optional generator of the parameter types of the method
    /// * `use_cache` - Whether the caller wants the cached lookup
    ///
    /// # Errors
    /// Returns [`crate::Error::Tokenizer`] if a string or method can not be resolved, or the
    /// error of the generator.
    pub fn load_method_info(
        &mut self,
        assembly_path: &str,
        class_name: &str,
        method_name: &str,
        function_id: u32,
        argument_types: Option<Generator<'_, 'a>>,
        use_cache: bool,
    ) -> Result<()> {
        if !use_cache || self.config.disable_method_cache {
            log::debug!(
                "[{}] uncached lookup of {class_name}::{method_name}",
                self.name
            );
            self.load_type(assembly_path, class_name)?;
            return self.load_method_info_from_type(method_name, argument_types);
        }

        let key = MethodInfoCacheKey::new(class_name, method_name, function_id);
        let lookup = self.cache.get_or_resolve(&key, || {
            Ok(MethodLookup {
                assembly_path: assembly_path.to_string(),
                class_name: class_name.to_string(),
                method_name: method_name.to_string(),
            })
        })?;
        if lookup.assembly_path != assembly_path {
            log::debug!(
                "[{}] cache key {key} is already bound to {}, keeping it",
                self.name,
                lookup.assembly_path
            );
        }
        log::debug!("[{}] cached lookup of {key}", self.name);

        let set = &mut self.instructions;
        set.append_string(key.as_str())?;
        set.append_string(&lookup.assembly_path)?;
        set.append_string(&lookup.class_name)?;
        set.append_string(&lookup.method_name)?;
        match argument_types {
            Some(argument_types) => argument_types(set)?,
            None => set.append(OpCode::Ldnull)?,
        }
        set.append_call(OpCode::Call, &self.config.cache_helper)
    }

    /// Emit a protected region catching `System.Exception`.
    ///
    /// Both the try body and the handler are left through a `leave` to one shared exit
    /// label. The handler is entered with the exception on the stack; with `rethrow` the
    /// exception is re-raised at the end of the handler instead of being swallowed.
    ///
    /// # Errors
    /// Returns [`crate::Error::StackImbalance`] if the stack is not empty at the start of the
    /// region, [`crate::Error::Malformed`] if a body leaves the region open, or the error of
    /// a body generator.
    pub fn try_catch<T, C>(&mut self, try_body: T, catch_body: C, rethrow: bool) -> Result<()>
    where
        T: FnOnce(&mut InstructionSet<'a>) -> Result<()>,
        C: FnOnce(&mut InstructionSet<'a>) -> Result<()>,
    {
        let set = &mut self.instructions;

        set.append_try_start()?;
        try_body(set)?;
        let exit = set.append_jump(OpCode::Leave)?;
        set.append_try_end()?;

        set.append_catch_start()?;
        catch_body(set)?;
        if rethrow {
            set.append(OpCode::Rethrow)?;
        }
        set.append_jump_to(OpCode::Leave, exit)?;
        set.append_catch_end()?;

        set.append_label(exit)
    }

    /// Emit the return of the method, loading `result_local` first unless the method
    /// returns `void`.
    ///
    /// # Errors
    /// See [`emit_return`].
    pub fn emit_return(&mut self, result_local: Option<u16>) -> Result<()> {
        emit_return(
            &mut self.instructions,
            &self.signature.return_type,
            result_local,
        )
    }
}

/// Emit `ret`, preceded by a load of `result_local` if `return_type` is not `void`.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if a non-`void` method has no result local.
pub fn emit_return(
    set: &mut InstructionSet<'_>,
    return_type: &SignatureParameter,
    result_local: Option<u16>,
) -> Result<()> {
    if !return_type.is_void() {
        let local = result_local
            .ok_or_else(|| malformed_error!("Method returns a value but has no result local"))?;
        set.append_load_local(local)?;
    }
    set.append(OpCode::Ret)
}

/// Construct a `System.Exception` with `message` and throw it.
///
/// # Errors
/// Returns [`crate::Error::Tokenizer`] if the string or constructor can not be resolved.
pub fn throw_exception(
    set: &mut InstructionSet<'_>,
    message: &str,
    in_mscorlib: bool,
) -> Result<()> {
    set.append_string(message)?;
    set.append_call(
        OpCode::Newobj,
        if in_mscorlib {
            EXCEPTION_CTOR_LOCAL
        } else {
            EXCEPTION_CTOR
        },
    )?;
    set.append(OpCode::Throw)
}

/// Throw a `System.Exception` with `message` if the value on top of the stack is `null`.
///
/// The value stays on the stack.
///
/// # Errors
/// Returns [`crate::Error::StackImbalance`] if the stack is empty, otherwise see
/// [`throw_exception`].
pub fn throw_exception_if_null(
    set: &mut InstructionSet<'_>,
    message: &str,
    in_mscorlib: bool,
) -> Result<()> {
    set.append(OpCode::Dup)?;
    let not_null = set.append_jump(OpCode::Brtrue)?;
    throw_exception(set, message, in_mscorlib)?;
    set.append_label(not_null)
}

fn write_line(set: &mut InstructionSet<'_>, message: &str) -> Result<()> {
    set.append_string(message)?;
    set.append_call(OpCode::Call, WRITE_LINE)
}

/// Print `message` if the value on top of the stack is `null`, keeping the value
fn emit_not_found_check(set: &mut InstructionSet<'_>, message: &str) -> Result<()> {
    set.append(OpCode::Dup)?;
    let found = set.append_jump(OpCode::Brtrue)?;
    write_line(set, message)?;
    set.append_label(found)
}

fn emit_parameter_type_array(
    set: &mut InstructionSet<'_>,
    params: &[SignatureParameter],
) -> Result<()> {
    let generators = params
        .iter()
        .map(|param| generator(move |set| set.append_type_of_argument(param)))
        .collect();
    emit_array(set, TYPE, generators)
}

/// `newarr element_type` sized to the generators, each element stored at its index
fn emit_array<'a>(
    set: &mut InstructionSet<'a>,
    element_type: &str,
    generators: Vec<Generator<'_, 'a>>,
) -> Result<()> {
    let length = i32::try_from(generators.len())
        .map_err(|_| malformed_error!("Array of {} elements is too large", generators.len()))?;
    set.append_int(length)?;
    set.append_type_op(OpCode::Newarr, element_type)?;

    for (index, element) in generators.into_iter().enumerate() {
        set.append(OpCode::Dup)?;
        // index < length, which fits into i32
        set.append_int(i32::try_from(index).map_err(|_| Error::OutOfBounds)?)?;

        let depth = set.stack_depth();
        element(set)?;
        if set.stack_depth() != depth + 1 || !set.is_reachable() {
            return Err(Error::StackImbalance(format!(
                "array element {} left {} values instead of one",
                index,
                i32::from(set.stack_depth()) - i32::from(depth)
            )));
        }

        set.append(OpCode::StelemRef)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{
            method::ExceptionHandlerFlags,
            token::Token,
        },
        rewriter::{MethodInfoCache, RewriterConfig},
        test::{disassemble, tiny_body, MockFunction, MockTokenizer},
    };

    fn ops(bytes: &[u8]) -> Vec<OpCode> {
        disassemble(bytes).into_iter().map(|(op, _)| op).collect()
    }

    fn config(diagnostics: bool, disable_method_cache: bool) -> RewriterConfig {
        RewriterConfig {
            diagnostics,
            disable_method_cache,
            ..RewriterConfig::default()
        }
    }

    fn stores_of(bytes: &[u8]) -> usize {
        ops(bytes)
            .into_iter()
            .filter(|op| *op == OpCode::StelemRef)
            .count()
    }

    #[test]
    fn parameter_types_array() {
        // static void M(int32, string)
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x02, 0x01, 0x08, 0x0E]);
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();

        rewriter.emit_array_of_parameter_types().unwrap();
        let set = rewriter.instructions();
        assert_eq!(set.stack_depth(), 1);

        let code = set.bytes().unwrap();
        let instructions = disassemble(&code);
        assert_eq!(instructions[0], (OpCode::LdcI4, Some(2)));
        assert_eq!(instructions[1].0, OpCode::Newarr);
        assert_eq!(
            function
                .mock_tokenizer()
                .type_name(Token::new(instructions[1].1.unwrap())),
            Some(TYPE.to_string())
        );
        assert_eq!(
            ops(&code)[2..],
            [
                OpCode::Dup,
                OpCode::LdcI4,
                OpCode::Ldtoken,
                OpCode::Call,
                OpCode::StelemRef,
                OpCode::Dup,
                OpCode::LdcI4,
                OpCode::Ldtoken,
                OpCode::Call,
                OpCode::StelemRef,
            ]
        );
        assert_eq!(instructions[3], (OpCode::LdcI4, Some(0)));
        assert_eq!(instructions[8], (OpCode::LdcI4, Some(1)));

        let int32 = Token::new(instructions[4].1.unwrap());
        let string = Token::new(instructions[9].1.unwrap());
        assert_eq!(function.mock_tokenizer().type_spec(int32), Some(vec![0x08]));
        assert_eq!(function.mock_tokenizer().type_spec(string), Some(vec![0x0E]));
    }

    #[test]
    fn parameter_types_generator() {
        // static void M(int32)
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x01, 0x01, 0x08]);
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();

        let types = rewriter.array_of_parameter_types();
        types(rewriter.instructions()).unwrap();
        assert_eq!(rewriter.instructions().stack_depth(), 1);
        assert_eq!(stores_of(&rewriter.instructions().bytes().unwrap()), 1);
    }

    #[test]
    fn object_array_static() {
        // static void M(int32, string, int32&)
        let function = MockFunction::new(
            tiny_body(&[0x2A]),
            vec![0x00, 0x03, 0x01, 0x08, 0x0E, 0x10, 0x08],
        );
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();
        rewriter.build_object_array_of_parameters().unwrap();

        let code = rewriter.instructions().bytes().unwrap();
        assert_eq!(stores_of(&code), 3);
        assert_eq!(
            ops(&code),
            vec![
                OpCode::LdcI4,
                OpCode::Newarr,
                OpCode::Dup,
                OpCode::LdcI4,
                OpCode::Ldarg0,
                OpCode::Box,
                OpCode::StelemRef,
                OpCode::Dup,
                OpCode::LdcI4,
                OpCode::Ldarg1,
                OpCode::StelemRef,
                OpCode::Dup,
                OpCode::LdcI4,
                OpCode::Ldarg2,
                OpCode::Ldobj,
                OpCode::Box,
                OpCode::StelemRef,
            ]
        );
    }

    #[test]
    fn object_array_instance() {
        // instance void M(object, bool)
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x20, 0x02, 0x01, 0x1C, 0x02]);
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();
        rewriter.build_object_array_of_parameters().unwrap();

        let code = rewriter.instructions().bytes().unwrap();
        let loads: Vec<OpCode> = ops(&code)
            .into_iter()
            .filter(|op| matches!(op, OpCode::Ldarg0 | OpCode::Ldarg1 | OpCode::Ldarg2))
            .collect();
        assert_eq!(loads, vec![OpCode::Ldarg1, OpCode::Ldarg2]);
        assert_eq!(stores_of(&code), 2);
        assert_eq!(rewriter.instructions().stack_depth(), 1);
    }

    #[test]
    fn empty_parameter_list() {
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x00, 0x01]);
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();
        rewriter.build_object_array_of_parameters().unwrap();

        let code = rewriter.instructions().bytes().unwrap();
        assert_eq!(ops(&code), vec![OpCode::LdcI4, OpCode::Newarr]);
        assert_eq!(disassemble(&code)[0].1, Some(0));
    }

    #[test]
    fn array_elements_must_push_one_value() {
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x00, 0x01]);
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();

        rewriter
            .load_array(vec![
                generator(|set| set.append_string("a")),
                generator(|set| set.append(OpCode::Ldnull)),
            ])
            .unwrap();
        assert_eq!(rewriter.instructions().stack_depth(), 1);

        let result = rewriter.load_array(vec![generator(|set| {
            set.append(OpCode::Ldnull)?;
            set.append(OpCode::Ldnull)
        })]);
        assert!(matches!(result, Err(Error::StackImbalance(_))));

        let result = rewriter.load_array(vec![generator(|_| Ok(()))]);
        assert!(matches!(result, Err(Error::StackImbalance(_))));
    }

    #[test]
    fn load_type_with_diagnostics() {
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x00, 0x01]);

        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();
        rewriter.load_type("C:\\tracer.dll", "Sample.Tracer").unwrap();
        assert_eq!(
            ops(&rewriter.instructions().bytes().unwrap()),
            vec![OpCode::Ldstr, OpCode::Call, OpCode::Ldstr, OpCode::Callvirt]
        );
        assert_eq!(rewriter.instructions().stack_depth(), 1);

        let mut rewriter = MethodRewriter::new(&function, config(true, false)).unwrap();
        rewriter.load_type("C:\\tracer.dll", "Sample.Tracer").unwrap();
        assert_eq!(
            ops(&rewriter.instructions().bytes().unwrap())[4..],
            [
                OpCode::Dup,
                OpCode::Brtrue,
                OpCode::Ldstr,
                OpCode::Call,
            ]
        );
        assert_eq!(rewriter.instructions().stack_depth(), 1);
        assert!(rewriter.instructions().is_reachable());
    }

    #[test]
    fn reflective_invocation() {
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x20, 0x01, 0x01, 0x08]);
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();

        rewriter.load_type("tracer.dll", "Sample.Tracer").unwrap();
        let types = rewriter.array_of_parameter_types();
        rewriter.load_method_info_from_type("Enter", Some(types)).unwrap();
        assert_eq!(rewriter.instructions().stack_depth(), 1);

        rewriter.instructions().append(OpCode::Ldnull).unwrap();
        rewriter.build_object_array_of_parameters().unwrap();
        rewriter.invoke_method_info().unwrap();
        rewriter.instructions().append(OpCode::Pop).unwrap();
        assert_eq!(rewriter.instructions().stack_depth(), 0);

        let members: Vec<String> = disassemble(&rewriter.instructions().bytes().unwrap())
            .into_iter()
            .filter(|(op, _)| matches!(op, OpCode::Call | OpCode::Callvirt))
            .filter_map(|(_, token)| function.mock_tokenizer().member_name(Token::new(token?)))
            .collect();
        assert_eq!(
            members,
            vec![
                LOAD_FROM,
                GET_TYPE,
                crate::assembly::GET_TYPE_FROM_HANDLE,
                GET_METHOD_WITH_TYPES,
                INVOKE
            ]
        );
    }

    #[test]
    fn cached_method_info() {
        let cache = MethodInfoCache::new();
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x00, 0x01]);
        let mut rewriter =
            MethodRewriter::with_cache(&function, config(false, false), &cache).unwrap();

        rewriter
            .load_method_info("tracer.dll", "Sample.Tracer", "Enter", 7, None, true)
            .unwrap();
        assert_eq!(rewriter.instructions().stack_depth(), 1);

        let instructions = disassemble(&rewriter.instructions().bytes().unwrap());
        let tokenizer = function.mock_tokenizer();
        assert_eq!(
            tokenizer.string_value(Token::new(instructions[0].1.unwrap())),
            Some("Sample.Tracer.Enter_7".to_string())
        );
        assert_eq!(instructions[4].0, OpCode::Ldnull);
        assert_eq!(instructions[5].0, OpCode::Call);
        assert_eq!(
            tokenizer.member_name(Token::new(instructions[5].1.unwrap())),
            Some(crate::rewriter::DEFAULT_CACHE_HELPER.to_string())
        );

        let key = MethodInfoCacheKey::new("Sample.Tracer", "Enter", 7);
        assert_eq!(cache.get(&key).unwrap().assembly_path, "tracer.dll");
    }

    #[test]
    fn tokenizer_failures_are_not_fatal() {
        // instance void M(int32)
        let signature = vec![0x20, 0x01, 0x01, 0x08];
        let failing = |name: &str| {
            MockFunction::new(tiny_body(&[0x2A]), signature.clone())
                .with_tokenizer(MockTokenizer::failing_on(name))
        };

        let function = failing("Sample.Missing");
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();
        let error = rewriter.append_local_type("Sample.Missing").unwrap_err();
        assert!(matches!(error, Error::Tokenizer(_)) && !error.is_fatal());
        assert!(!rewriter.locals().is_modified());

        let function = failing("LoadFrom");
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();
        let error = rewriter.load_type("tracer.dll", "Sample.Tracer").unwrap_err();
        assert!(matches!(error, Error::Tokenizer(_)) && !error.is_fatal());

        let function = failing("GetTypeFromHandle");
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();
        let error = rewriter.emit_array_of_parameter_types().unwrap_err();
        assert!(matches!(error, Error::Tokenizer(_)) && !error.is_fatal());

        let function = failing("System.Exception");
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();
        let error = rewriter
            .try_catch(|_| Ok(()), |set| set.append(OpCode::Pop), false)
            .unwrap_err();
        assert!(matches!(error, Error::Tokenizer(_)) && !error.is_fatal());
        assert!(rewriter.instructions().exceptions().added_clauses().is_empty());
        assert!(function.written().is_none());
    }

    #[test]
    fn first_registration_of_a_key_wins() {
        let cache = MethodInfoCache::new();

        for path in ["first.dll", "second.dll"] {
            let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x00, 0x01]);
            let mut rewriter =
                MethodRewriter::with_cache(&function, config(false, false), &cache).unwrap();
            rewriter
                .load_method_info(path, "Sample.Tracer", "Enter", 7, None, true)
                .unwrap();

            let instructions = disassemble(&rewriter.instructions().bytes().unwrap());
            assert_eq!(
                function
                    .mock_tokenizer()
                    .string_value(Token::new(instructions[1].1.unwrap())),
                Some("first.dll".to_string())
            );
        }

        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_toggle_forces_reflection() {
        let cache = MethodInfoCache::new();
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x00, 0x01]);

        for (use_cache, disable) in [(false, false), (true, true)] {
            let mut rewriter =
                MethodRewriter::with_cache(&function, config(false, disable), &cache).unwrap();
            rewriter
                .load_method_info("tracer.dll", "Sample.Tracer", "Enter", 7, None, use_cache)
                .unwrap();
            assert_eq!(
                ops(&rewriter.instructions().bytes().unwrap()),
                vec![
                    OpCode::Ldstr,
                    OpCode::Call,
                    OpCode::Ldstr,
                    OpCode::Callvirt,
                    OpCode::Ldstr,
                    OpCode::Callvirt,
                ]
            );
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn try_catch_region() {
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x00, 0x01]);
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();

        rewriter
            .try_catch(
                |set| write_line(set, "inside"),
                |set| set.append(OpCode::Pop),
                false,
            )
            .unwrap();

        let set = rewriter.instructions();
        assert_eq!(set.stack_depth(), 0);
        assert!(set.is_reachable());

        let clauses = set.exceptions().added_clauses().to_vec();
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].flags, ExceptionHandlerFlags::EXCEPTION);
        // ldstr, call, leave
        assert_eq!(clauses[0].try_offset, 0);
        assert_eq!(clauses[0].try_length, 15);
        // pop, leave
        assert_eq!(clauses[0].handler_offset, 15);
        assert_eq!(clauses[0].handler_length, 6);

        let code = set.bytes().unwrap();
        assert_eq!(code.len(), 21);
        // both leaves target the end of the region
        assert_eq!(&code[11..15], &6_i32.to_le_bytes());
        assert_eq!(&code[17..21], &0_i32.to_le_bytes());
    }

    #[test]
    fn try_catch_rethrow() {
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x00, 0x01]);
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();

        rewriter
            .try_catch(|_| Ok(()), |set| set.append(OpCode::Pop), true)
            .unwrap();
        assert_eq!(
            ops(&rewriter.instructions().bytes().unwrap()),
            vec![OpCode::Leave, OpCode::Pop, OpCode::Rethrow, OpCode::Leave]
        );
    }

    #[test]
    fn try_catch_requires_empty_stack() {
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x00, 0x01]);
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();

        rewriter.instructions().append(OpCode::Ldnull).unwrap();
        let result = rewriter.try_catch(|_| Ok(()), |set| set.append(OpCode::Pop), false);
        assert!(matches!(result, Err(Error::StackImbalance(_))));
    }

    #[test]
    fn returns() {
        // static int32 M()
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x00, 0x08]);
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();
        let result = rewriter.append_return_type_local().unwrap();
        assert!(rewriter.emit_return(None).is_err());
        rewriter.emit_return(result).unwrap();
        assert_eq!(
            ops(&rewriter.instructions().bytes().unwrap()),
            vec![OpCode::Ldloc0, OpCode::Ret]
        );

        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x00, 0x01]);
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();
        rewriter.emit_return(Some(3)).unwrap();
        assert_eq!(
            ops(&rewriter.instructions().bytes().unwrap()),
            vec![OpCode::Ret]
        );
    }

    #[test]
    fn throws() {
        let function = MockFunction::new(tiny_body(&[0x2A]), vec![0x00, 0x00, 0x01]);
        let mut rewriter = MethodRewriter::new(&function, config(false, false)).unwrap();
        let set = rewriter.instructions();

        set.append(OpCode::Ldnull).unwrap();
        throw_exception_if_null(set, "value is null", false).unwrap();
        assert_eq!(set.stack_depth(), 1);
        assert!(set.is_reachable());
        set.append(OpCode::Pop).unwrap();
        throw_exception(set, "always", true).unwrap();
        assert!(!set.is_reachable());

        let instructions = disassemble(&set.bytes().unwrap());
        let tokenizer = function.mock_tokenizer();
        assert_eq!(
            instructions.iter().map(|(op, _)| *op).collect::<Vec<_>>(),
            vec![
                OpCode::Ldnull,
                OpCode::Dup,
                OpCode::Brtrue,
                OpCode::Ldstr,
                OpCode::Newobj,
                OpCode::Throw,
                OpCode::Pop,
                OpCode::Ldstr,
                OpCode::Newobj,
                OpCode::Throw,
            ]
        );
        // brtrue skips ldstr, newobj and throw
        assert_eq!(instructions[2].1, Some(11));
        assert_eq!(
            tokenizer.member_name(Token::new(instructions[4].1.unwrap())),
            Some(EXCEPTION_CTOR.to_string())
        );
        assert_eq!(
            tokenizer.member_name(Token::new(instructions[8].1.unwrap())),
            Some(EXCEPTION_CTOR_LOCAL.to_string())
        );
    }
}
