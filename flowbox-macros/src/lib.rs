use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

mod flowunit_meta;
use flowunit_meta::{parse_flowunit_info, parse_options, parse_ports, PortField};

#[proc_macro_derive(FlowUnitDesc, attributes(flowunit, option, input, output))]
pub fn derive_flowunit_desc(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let info = match parse_flowunit_info(&input) {
        Ok(info) => info,
        Err(e) => return e.write_errors().into(),
    };
    let options = match parse_options(&input) {
        Ok(options) => options,
        Err(e) => return e.write_errors().into(),
    };
    let (inputs, outputs) = match parse_ports(&input) {
        Ok(ports) => ports,
        Err(e) => return e.write_errors().into(),
    };

    let struct_name = &input.ident;
    let unit_name = &info.name;
    let group = &info.group;
    let description = info.description.clone().unwrap_or_default();

    let flow_type = match info.flow_type.as_deref() {
        None | Some("normal") => quote! { crate::core::FlowType::Normal },
        Some("stream") => quote! { crate::core::FlowType::Stream },
        Some(other) => {
            let msg = format!("unknown flow_type `{}`, expected `normal` or `stream`", other);
            return syn::Error::new_spanned(struct_name, msg).to_compile_error().into();
        }
    };

    let option_metas = options.iter().filter_map(|f| {
        let field_name = f.ident.as_ref()?.to_string();
        let name = f.name.clone().unwrap_or(field_name);
        let kind = f
            .kind
            .clone()
            .unwrap_or_else(|| extract_type_name(&f.ty).to_string());
        let required = f.required;
        let option_description = f.description.clone().unwrap_or_default();
        let default = match &f.default {
            Some(value) => quote! { Some(#value.to_string()) },
            None => quote! { None },
        };

        Some(quote! {
            crate::registry::FlowUnitOption {
                name: #name.to_string(),
                option_type: #kind.to_string(),
                required: #required,
                default: #default,
                description: #option_description.to_string(),
            }
        })
    });

    let input_metas = inputs.iter().filter_map(port_tokens);
    let output_metas = outputs.iter().filter_map(port_tokens);

    let (factory, create_fn) = if info.external_factory {
        (quote! { None }, quote! {})
    } else {
        (
            quote! { Some(create_instance as crate::registry::FlowUnitFactory) },
            quote! {
                fn create_instance() -> Box<dyn crate::core::FlowUnit> {
                    Box::new(#struct_name::default())
                }
            },
        )
    };

    let lowered = struct_name.to_string().to_lowercase();
    let mod_name = syn::Ident::new(
        &format!("__flowunit_registration_{}", lowered),
        struct_name.span(),
    );
    let factory_fn_name = syn::Ident::new(
        &format!("create_descriptor_{}", lowered),
        struct_name.span(),
    );

    let expanded = quote! {
        mod #mod_name {
            use super::*;

            #create_fn

            pub(super) fn #factory_fn_name() -> crate::registry::FlowUnitDescriptor {
                crate::registry::FlowUnitDescriptor {
                    name: #unit_name.to_string(),
                    group: #group.to_string(),
                    description: #description.to_string(),
                    flow_type: #flow_type,
                    inputs: vec![#(#input_metas),*],
                    outputs: vec![#(#output_metas),*],
                    options: vec![#(#option_metas),*],
                    factory: #factory,
                }
            }

            ::inventory::submit! {
                crate::registry::FlowUnitDescriptorFactoryWrapper(#factory_fn_name)
            }
        }

        impl #struct_name {
            /// Descriptor generated from the flow unit's declared ports and options
            pub fn descriptor() -> crate::registry::FlowUnitDescriptor {
                #mod_name::#factory_fn_name()
            }
        }
    };

    TokenStream::from(expanded)
}

fn port_tokens(port: &PortField) -> Option<proc_macro2::TokenStream> {
    let field_name = port.ident.as_ref()?.to_string();
    let name = port
        .name
        .clone()
        .unwrap_or_else(|| field_name.trim_start_matches('_').to_string());
    let device = port.device.clone().unwrap_or_else(|| "cpu".to_string());

    Some(quote! {
        crate::registry::PortDescriptor {
            name: #name.to_string(),
            device_type: #device.to_string(),
        }
    })
}

fn extract_type_name(ty: &syn::Type) -> &'static str {
    let type_str = quote!(#ty).to_string();

    if type_str.contains("f64") || type_str.contains("f32") {
        "float"
    } else if type_str.contains("u32") || type_str.contains("i32")
        || type_str.contains("u64") || type_str.contains("i64")
        || type_str.contains("usize") || type_str.contains("isize") {
        "int"
    } else if type_str.contains("String") || type_str.contains("str") {
        "string"
    } else if type_str.contains("bool") {
        "bool"
    } else {
        "unknown"
    }
}
