use darling::{FromAttributes, FromField};
use syn::{DeriveInput, Fields};

/// Parsed attributes from #[flowunit(...)]
#[derive(Debug, FromAttributes)]
#[darling(attributes(flowunit))]
pub struct FlowUnitArgs {
    pub name: String,
    pub group: String,

    #[darling(default)]
    pub flow_type: Option<String>,

    #[darling(default)]
    pub description: Option<String>,

    /// Set when the unit needs constructor arguments and cannot be built from `Default`
    #[darling(default)]
    pub external_factory: bool,
}

/// Parsed attributes from #[option(...)]
#[derive(Debug, FromField)]
#[darling(attributes(option))]
pub struct OptionField {
    pub ident: Option<syn::Ident>,
    pub ty: syn::Type,

    #[darling(default)]
    pub name: Option<String>,

    #[darling(default)]
    pub kind: Option<String>,

    #[darling(default)]
    pub required: bool,

    #[darling(default)]
    pub default: Option<String>,

    #[darling(default)]
    pub description: Option<String>,
}

/// Parsed attributes from #[input(...)] / #[output(...)]
#[derive(Debug, FromField)]
#[darling(attributes(input, output))]
pub struct PortField {
    pub ident: Option<syn::Ident>,

    #[darling(default)]
    pub name: Option<String>,

    #[darling(default)]
    pub device: Option<String>,
}

pub fn parse_flowunit_info(input: &DeriveInput) -> darling::Result<FlowUnitArgs> {
    FlowUnitArgs::from_attributes(&input.attrs)
}

fn named_fields(input: &DeriveInput) -> Option<&syn::punctuated::Punctuated<syn::Field, syn::token::Comma>> {
    match &input.data {
        syn::Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => Some(&fields.named),
            _ => None,
        },
        _ => None,
    }
}

pub fn parse_options(input: &DeriveInput) -> darling::Result<Vec<OptionField>> {
    let Some(fields) = named_fields(input) else {
        return Ok(Vec::new());
    };

    fields
        .iter()
        .filter(|f| f.attrs.iter().any(|attr| attr.path().is_ident("option")))
        .map(OptionField::from_field)
        .collect()
}

pub fn parse_ports(input: &DeriveInput) -> darling::Result<(Vec<PortField>, Vec<PortField>)> {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();

    let Some(fields) = named_fields(input) else {
        return Ok((inputs, outputs));
    };

    for field in fields.iter() {
        if field.attrs.iter().any(|attr| attr.path().is_ident("input")) {
            inputs.push(PortField::from_field(field)?);
        }

        if field.attrs.iter().any(|attr| attr.path().is_ident("output")) {
            outputs.push(PortField::from_field(field)?);
        }
    }

    Ok((inputs, outputs))
}
