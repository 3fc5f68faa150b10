use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::ext::IdentExt;
use syn::{
    Data, DeriveInput, Fields, GenericArgument, LitStr, PathArguments, Type, parse_macro_input,
    spanned::Spanned,
};

/// Derives `rustdac::entity::Entity`.
///
/// ```ignore
/// #[derive(Entity, Default)]
/// #[entity(table = "users", schema = "app")]
/// struct User {
///     #[column("id,pk")]
///     id: String,
///     #[column("team,ref,team_id+id")]
///     team: Option<Box<Team>>,
/// }
/// ```
///
/// Only fields carrying `#[column("...")]` are mapped. The tag is kept as
/// written; its kind decides how the field converts to and from a `Value`.
#[proc_macro_derive(Entity, attributes(entity, column))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_entity(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

struct EntityOptions {
    table: Option<String>,
    schema: String,
}

enum Shape {
    Value { inner: Type, nullable: bool },
    Json { nullable: bool },
    One { target: Type, boxed: bool },
    Many { target: Type },
}

fn expand_entity(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = input.ident;
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.generics,
            "Entity does not support generic structs",
        ));
    }
    let options = parse_entity_options(&input.attrs)?;

    let Data::Struct(data_struct) = input.data else {
        return Err(syn::Error::new(
            struct_name.span(),
            "Entity can only be derived for structs",
        ));
    };
    let Fields::Named(named_fields) = data_struct.fields else {
        return Err(syn::Error::new(
            struct_name.span(),
            "Entity requires named fields",
        ));
    };

    let entity_name = struct_name.to_string();
    let table = options
        .table
        .unwrap_or_else(|| to_snake_case(&entity_name));
    let schema = options.schema;

    let mut descriptors = Vec::<TokenStream2>::new();
    let mut getters = Vec::<TokenStream2>::new();
    let mut setters = Vec::<TokenStream2>::new();

    for field in named_fields.named {
        let Some(tag) = parse_column_tag(&field.attrs)? else {
            continue;
        };
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new(field.span(), "Entity requires named fields"))?;
        let field_name = ident.unraw().to_string();
        let shape = classify(&field.ty, &tag)?;
        let ty = &field.ty;

        let (field_type, getter, setter) = match shape {
            Shape::Value { inner, nullable } => (
                quote! {
                    ::rustdac::entity::FieldType::Value {
                        type_id: ::std::any::TypeId::of::<#inner>(),
                        type_name: stringify!(#inner),
                        nullable: #nullable,
                    }
                },
                quote! { Ok(::rustdac::core::ToValue::to_value(&self.#ident)) },
                quote! { self.#ident = <#ty as ::rustdac::core::FromValue>::from_value(value)?; },
            ),
            Shape::Json { nullable } => (
                quote! {
                    ::rustdac::entity::FieldType::Json {
                        type_name: stringify!(#ty),
                        nullable: #nullable,
                    }
                },
                quote! { ::rustdac::entity::encode_json(&self.#ident) },
                quote! { self.#ident = ::rustdac::entity::decode_json::<#ty>(value)?; },
            ),
            Shape::One { target, boxed } => {
                let assign = if boxed {
                    quote! { ::rustdac::entity::decode_one::<#target>(value)?.map(::std::boxed::Box::new) }
                } else {
                    quote! { ::rustdac::entity::decode_one::<#target>(value)? }
                };
                (
                    entity_field_type(&target, false),
                    quote! { Ok(::rustdac::Value::Null) },
                    quote! { self.#ident = #assign; },
                )
            }
            Shape::Many { target } => (
                entity_field_type(&target, true),
                quote! { Ok(::rustdac::Value::Null) },
                quote! { self.#ident = ::rustdac::entity::decode_many::<#target>(value)?; },
            ),
        };

        descriptors.push(quote! {
            ::rustdac::entity::FieldDescriptor {
                field: #field_name,
                tag: #tag,
                field_type: #field_type,
            }
        });
        getters.push(quote! { #field_name => #getter, });
        setters.push(quote! { #field_name => { #setter Ok(()) } });
    }

    Ok(quote! {
        impl ::rustdac::entity::Entity for #struct_name {
            fn descriptor() -> ::rustdac::entity::EntityDescriptor {
                ::rustdac::entity::EntityDescriptor {
                    type_id: ::std::any::TypeId::of::<Self>(),
                    name: #entity_name,
                    schema: #schema,
                    table: #table,
                    fields: ::std::vec![#(#descriptors),*],
                }
            }

            fn field_value(&self, field: &str) -> ::rustdac::Result<::rustdac::Value> {
                match field {
                    #(#getters)*
                    other => Err(::rustdac::DacError::unknown_field(#entity_name, other)),
                }
            }

            #[allow(unused_variables)]
            fn set_field_value(&mut self, field: &str, value: ::rustdac::Value) -> ::rustdac::Result<()> {
                match field {
                    #(#setters)*
                    other => Err(::rustdac::DacError::unknown_field(#entity_name, other)),
                }
            }
        }
    })
}

fn entity_field_type(target: &Type, many: bool) -> TokenStream2 {
    quote! {
        ::rustdac::entity::FieldType::Entity {
            descriptor: <#target as ::rustdac::entity::Entity>::descriptor,
            type_id: ::std::any::TypeId::of::<#target>(),
            type_name: stringify!(#target),
            many: #many,
        }
    }
}

/// Kind named by the tag: the second segment without `+conflict`.
fn tag_kind(tag: &str) -> String {
    let kind = tag.split(',').nth(1).unwrap_or("").trim();
    let kind = kind.strip_suffix("+conflict").unwrap_or(kind);
    if kind.is_empty() {
        "normal".to_string()
    } else {
        kind.to_ascii_lowercase()
    }
}

fn classify(ty: &Type, tag: &LitStr) -> syn::Result<Shape> {
    let option = generic_inner(ty, "Option");
    match tag_kind(&tag.value()).as_str() {
        "json" => Ok(Shape::Json {
            nullable: option.is_some(),
        }),
        "ref" | "link" => {
            let inner = option.ok_or_else(|| {
                syn::Error::new(ty.span(), "ref and link fields must be Option<T> or Option<Box<T>>")
            })?;
            match generic_inner(inner, "Box") {
                Some(target) => Ok(Shape::One {
                    target: target.clone(),
                    boxed: true,
                }),
                None => Ok(Shape::One {
                    target: inner.clone(),
                    boxed: false,
                }),
            }
        }
        "links" | "tree" => {
            let target = generic_inner(ty, "Vec")
                .ok_or_else(|| syn::Error::new(ty.span(), "links and tree fields must be Vec<T>"))?;
            Ok(Shape::Many {
                target: target.clone(),
            })
        }
        _ => Ok(Shape::Value {
            inner: option.unwrap_or(ty).clone(),
            nullable: option.is_some(),
        }),
    }
}

/// `T` of `wrapper<T>`, matching the last path segment only.
fn generic_inner<'a>(ty: &'a Type, wrapper: &str) -> Option<&'a Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != wrapper {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(inner) if args.args.len() == 1 => Some(inner),
        _ => None,
    }
}

fn parse_entity_options(attrs: &[syn::Attribute]) -> syn::Result<EntityOptions> {
    let mut options = EntityOptions {
        table: None,
        schema: String::new(),
    };

    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let lit: LitStr = meta.value()?.parse()?;
                options.table = Some(lit.value());
                return Ok(());
            }

            if meta.path.is_ident("schema") {
                let lit: LitStr = meta.value()?.parse()?;
                options.schema = lit.value();
                return Ok(());
            }

            Err(meta.error(
                "Unsupported entity attribute. Supported: table = \"...\", schema = \"...\"",
            ))
        })?;
    }

    Ok(options)
}

fn parse_column_tag(attrs: &[syn::Attribute]) -> syn::Result<Option<LitStr>> {
    let mut tag = None;
    for attr in attrs {
        if !attr.path().is_ident("column") {
            continue;
        }
        if tag.is_some() {
            return Err(syn::Error::new(attr.span(), "duplicate #[column] attribute"));
        }
        tag = Some(attr.parse_args::<LitStr>()?);
    }
    Ok(tag)
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (idx, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if idx > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_kind() {
        assert_eq!(tag_kind("id,pk"), "pk");
        assert_eq!(tag_kind("email,+conflict"), "normal");
        assert_eq!(tag_kind("code,pk+conflict"), "pk");
        assert_eq!(tag_kind("name"), "normal");
        assert_eq!(tag_kind("projects,links,id+owner_id,name DESC"), "links");
    }

    #[test]
    fn test_classify_shapes() {
        let tag = |text: &str| LitStr::new(text, proc_macro2::Span::call_site());
        let ty: Type = syn::parse_quote!(Option<Box<Team>>);
        assert!(matches!(classify(&ty, &tag("team,ref,team_id+id")).unwrap(), Shape::One { boxed: true, .. }));

        let ty: Type = syn::parse_quote!(Vec<Member>);
        assert!(matches!(classify(&ty, &tag("reports,tree,id+mentor_id")).unwrap(), Shape::Many { .. }));
        assert!(classify(&ty, &tag("team,ref,team_id+id")).is_err());

        let ty: Type = syn::parse_quote!(Option<i64>);
        assert!(matches!(classify(&ty, &tag("age")).unwrap(), Shape::Value { nullable: true, .. }));
    }

    #[test]
    fn test_default_table_name() {
        assert_eq!(to_snake_case("UserToken"), "user_token");
        assert_eq!(to_snake_case("Team"), "team");
    }
}
